use std::sync::Arc;

use parking_lot::Mutex;

use kestrel_common::api::{Deadline, PushSchemaRequest};
use kestrel_common::collection::CollectionMetadata;
use kestrel_common::config::{ClientConfig, PartitionConfig};
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::schema::Schema;
use kestrel_common::transport::PartitionTransport;
use kestrel_partition::PartitionModule;
use kestrel_storage::MemPlog;

use crate::cpo::{CpoClient, CpoService};
use crate::transport::{LocalTransport, RoutedPeers};
use crate::tso::{TsoClient, TsoService};

/// A complete single-process deployment: CPO, TSO and partition modules
/// wired over the local transport. Used by the bench driver and the
/// integration suites.
pub struct LocalCluster {
    pub cpo_service: Arc<CpoService>,
    pub cpo_client: Arc<CpoClient>,
    pub tso_service: Arc<TsoService>,
    pub tso_client: Arc<TsoClient>,
    pub transport: Arc<LocalTransport>,
    partition_config: PartitionConfig,
    modules: Mutex<Vec<Arc<PartitionModule>>>,
}

impl LocalCluster {
    pub fn new(client_config: ClientConfig, partition_config: PartitionConfig) -> Arc<Self> {
        let cpo_service = Arc::new(CpoService::new());
        let tso_service = Arc::new(TsoService::new(1));
        let tso_client = Arc::new(TsoClient::new(
            tso_service.clone(),
            client_config.tso_batch_size,
        ));
        let cpo_client = Arc::new(CpoClient::new(cpo_service.clone(), client_config));
        Arc::new(Self {
            cpo_service,
            cpo_client,
            tso_service,
            tso_client,
            transport: LocalTransport::new(),
            partition_config,
            modules: Mutex::new(Vec::new()),
        })
    }

    /// Create a collection and spin up one partition module per range end.
    pub fn create_collection(
        &self,
        metadata: CollectionMetadata,
        range_ends: Vec<String>,
    ) -> KestrelResult<()> {
        let endpoints: Vec<String> = (0..range_ends.len().max(1))
            .map(|i| format!("local://{}/p{i}", metadata.name))
            .collect();
        let collection =
            self.cpo_service
                .create_collection(metadata.clone(), endpoints, range_ends)?;

        let peers = RoutedPeers::new(self.cpo_client.clone(), self.transport.clone());
        let mut modules = self.modules.lock();
        for desc in &collection.partition_map.partitions {
            let module = PartitionModule::new(
                metadata.clone(),
                desc.clone(),
                self.partition_config.clone(),
                Arc::new(MemPlog::new()),
                peers.clone(),
                self.tso_client.clone(),
            );
            self.transport.register(&desc.endpoint, module.clone());
            module.start();
            modules.push(module);
        }
        Ok(())
    }

    /// Register a schema at the CPO and push it to every partition of the
    /// collection.
    pub async fn create_schema(
        &self,
        collection: &str,
        schema: Schema,
        deadline: Deadline,
    ) -> KestrelResult<()> {
        self.cpo_service.register_schema(collection, schema.clone())?;
        let coll = self
            .cpo_service
            .get_collection(collection)
            .ok_or_else(|| KestrelError::ServiceUnavailable(format!("unknown collection {collection}")))?;
        for desc in &coll.partition_map.partitions {
            self.transport
                .push_schema(
                    &desc.endpoint,
                    PushSchemaRequest {
                        collection: collection.to_string(),
                        schema: schema.clone(),
                    },
                    deadline,
                )
                .await?;
        }
        Ok(())
    }

    /// Stop every partition module.
    pub async fn shutdown(&self) {
        let modules: Vec<_> = self.modules.lock().drain(..).collect();
        for module in modules {
            module.graceful_stop().await;
        }
    }

    pub fn modules(&self) -> Vec<Arc<PartitionModule>> {
        self.modules.lock().clone()
    }
}
