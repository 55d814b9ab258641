use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use kestrel_common::api::{
    Deadline, PushSchemaRequest, PushSchemaResponse, QueryRequest, QueryResponse, ReadRequest,
    ReadResponse, TxnEndRequest, TxnEndResponse, TxnFinalizeRequest, TxnFinalizeResponse,
    TxnHeartbeatRequest, TxnHeartbeatResponse, TxnPushRequest, TxnPushResponse, WriteRequest,
    WriteResponse,
};
use kestrel_common::collection::Pvid;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::transport::PartitionTransport;
use kestrel_common::types::Key;
use kestrel_partition::{PartitionModule, PeerRouter};

use crate::cpo::CpoClient;

/// In-process transport: endpoint strings resolve directly to partition
/// modules. This is the whole wire for tests, the bench driver and
/// single-process deployments.
#[derive(Default)]
pub struct LocalTransport {
    endpoints: DashMap<String, Arc<PartitionModule>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, endpoint: &str, module: Arc<PartitionModule>) {
        self.endpoints.insert(endpoint.to_string(), module);
    }

    pub fn deregister(&self, endpoint: &str) {
        self.endpoints.remove(endpoint);
    }

    fn module(&self, endpoint: &str) -> KestrelResult<Arc<PartitionModule>> {
        self.endpoints
            .get(endpoint)
            .map(|m| m.clone())
            .ok_or_else(|| {
                KestrelError::ServiceUnavailable(format!("endpoint {endpoint} not registered"))
            })
    }
}

#[async_trait]
impl PartitionTransport for LocalTransport {
    async fn read(
        &self,
        endpoint: &str,
        req: ReadRequest,
        deadline: Deadline,
    ) -> KestrelResult<ReadResponse> {
        self.module(endpoint)?.handle_read(req, deadline).await
    }

    async fn write(
        &self,
        endpoint: &str,
        req: WriteRequest,
        deadline: Deadline,
    ) -> KestrelResult<WriteResponse> {
        self.module(endpoint)?.handle_write(req, deadline).await
    }

    async fn query(
        &self,
        endpoint: &str,
        req: QueryRequest,
        deadline: Deadline,
    ) -> KestrelResult<QueryResponse> {
        self.module(endpoint)?.handle_query(req, deadline).await
    }

    async fn txn_push(
        &self,
        endpoint: &str,
        req: TxnPushRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnPushResponse> {
        self.module(endpoint)?.handle_txn_push(req, deadline).await
    }

    async fn txn_end(
        &self,
        endpoint: &str,
        req: TxnEndRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnEndResponse> {
        self.module(endpoint)?.handle_txn_end(req, deadline).await
    }

    async fn txn_heartbeat(
        &self,
        endpoint: &str,
        req: TxnHeartbeatRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnHeartbeatResponse> {
        self.module(endpoint)?
            .handle_txn_heartbeat(req, deadline)
            .await
    }

    async fn txn_finalize(
        &self,
        endpoint: &str,
        req: TxnFinalizeRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnFinalizeResponse> {
        self.module(endpoint)?
            .handle_txn_finalize(req, deadline)
            .await
    }

    async fn push_schema(
        &self,
        endpoint: &str,
        req: PushSchemaRequest,
        deadline: Deadline,
    ) -> KestrelResult<PushSchemaResponse> {
        self.module(endpoint)?
            .handle_push_schema(req, deadline)
            .await
    }
}

/// Issue a partition request with routing and stale-map recovery: resolve
/// the owner, call, and on a stale-map answer invalidate + refresh + reissue
/// up to the configured retry budget.
pub async fn routed_request<R, F, Fut>(
    cpo: &CpoClient,
    collection: &str,
    key: &Key,
    reverse: bool,
    exclusive: bool,
    deadline: Deadline,
    mut call: F,
) -> KestrelResult<R>
where
    F: FnMut(String, Pvid) -> Fut,
    Fut: Future<Output = KestrelResult<R>>,
{
    let mut retries = cpo.config().partition_request_retries;
    loop {
        if deadline.is_over() {
            return Err(KestrelError::RequestTimeout(
                "partition request deadline exceeded".into(),
            ));
        }
        let (_, desc) = cpo
            .get_assigned_partition(deadline, collection, key, reverse, exclusive)
            .await?;
        match call(desc.endpoint.clone(), desc.pvid).await {
            Err(e) if e.is_retryable() && retries > 0 => {
                retries -= 1;
                tracing::debug!(collection, error = %e, "stale routing; refreshing and retrying");
                cpo.invalidate(collection);
                cpo.refresh_collection(collection, deadline).await?;
            }
            other => return other,
        }
    }
}

/// Key-routed peer access for the partition core, backed by the CPO client
/// and a transport. Push and finalize may route back to the calling
/// partition; the transport handles that like any other endpoint.
pub struct RoutedPeers {
    cpo: Arc<CpoClient>,
    transport: Arc<dyn PartitionTransport>,
}

impl RoutedPeers {
    pub fn new(cpo: Arc<CpoClient>, transport: Arc<dyn PartitionTransport>) -> Arc<Self> {
        Arc::new(Self { cpo, transport })
    }
}

#[async_trait]
impl PeerRouter for RoutedPeers {
    async fn txn_push(
        &self,
        collection: &str,
        routing_key: &Key,
        req: TxnPushRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnPushResponse> {
        routed_request(
            &self.cpo,
            collection,
            routing_key,
            false,
            false,
            deadline,
            |endpoint, pvid| {
                let mut req = req.clone();
                req.pvid = pvid;
                let transport = self.transport.clone();
                async move { transport.txn_push(&endpoint, req, deadline).await }
            },
        )
        .await
    }

    async fn txn_finalize(
        &self,
        collection: &str,
        routing_key: &Key,
        req: TxnFinalizeRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnFinalizeResponse> {
        routed_request(
            &self.cpo,
            collection,
            routing_key,
            false,
            false,
            deadline,
            |endpoint, pvid| {
                let mut req = req.clone();
                req.pvid = pvid;
                let transport = self.transport.clone();
                async move { transport.txn_finalize(&endpoint, req, deadline).await }
            },
        )
        .await
    }
}
