use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use kestrel_common::api::Deadline;
use kestrel_common::collection::{Collection, CollectionMetadata, HashScheme, PartitionDescriptor, PartitionMap};
use kestrel_common::config::ClientConfig;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::schema::Schema;
use kestrel_common::types::Key;

/// In-process control plane oracle: the authority for collection metadata,
/// partition maps and schemas.
#[derive(Default)]
pub struct CpoService {
    collections: DashMap<String, Collection>,
    schemas: DashMap<String, Vec<Schema>>,
}

impl CpoService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection and its partition map. Creating an existing
    /// collection returns the existing map unchanged.
    pub fn create_collection(
        &self,
        metadata: CollectionMetadata,
        endpoints: Vec<String>,
        range_ends: Vec<String>,
    ) -> KestrelResult<Collection> {
        if let Some(existing) = self.collections.get(&metadata.name) {
            return Ok(existing.clone());
        }
        let partition_map = match metadata.hash_scheme {
            HashScheme::Range => PartitionMap::from_range_ends(&endpoints, &range_ends)?,
            HashScheme::HashXx => PartitionMap::hashed(&endpoints)?,
        };
        let collection = Collection {
            metadata,
            partition_map,
        };
        tracing::info!(
            collection = %collection.metadata.name,
            partitions = collection.partition_map.partitions.len(),
            "collection created"
        );
        self.collections
            .insert(collection.metadata.name.clone(), collection.clone());
        Ok(collection)
    }

    pub fn get_collection(&self, name: &str) -> Option<Collection> {
        self.collections.get(name).map(|c| c.clone())
    }

    /// Register a schema version for a collection. Idempotent per
    /// (name, version).
    pub fn register_schema(&self, collection: &str, schema: Schema) -> KestrelResult<()> {
        schema.validate().map_err(KestrelError::BadParameter)?;
        let mut entry = self.schemas.entry(collection.to_string()).or_default();
        if !entry
            .iter()
            .any(|s| s.name == schema.name && s.version == schema.version)
        {
            entry.push(schema);
        }
        Ok(())
    }

    pub fn get_schemas(&self, collection: &str) -> Vec<Schema> {
        self.schemas
            .get(collection)
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

/// Client-side partition routing cache.
///
/// Resolves keys to partitions from a cached map, refreshing from the CPO on
/// stale-map errors. At most one refresh per collection is in flight;
/// concurrent callers attach as waiters and share the result.
pub struct CpoClient {
    service: Arc<CpoService>,
    cache: DashMap<String, Arc<Collection>>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<KestrelResult<Arc<Collection>>>>>>,
    config: ClientConfig,
}

impl CpoClient {
    pub fn new(service: Arc<CpoService>, config: ClientConfig) -> Self {
        Self {
            service,
            cache: DashMap::new(),
            waiters: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Drop the cached map for a collection (after `RefreshCollection`).
    pub fn invalidate(&self, collection: &str) {
        self.cache.remove(collection);
    }

    /// Resolve the partition serving `key`, fetching or refreshing the
    /// collection map as needed.
    pub async fn get_assigned_partition(
        &self,
        deadline: Deadline,
        collection: &str,
        key: &Key,
        reverse: bool,
        exclusive: bool,
    ) -> KestrelResult<(Arc<Collection>, PartitionDescriptor)> {
        if let Some(cached) = self.cache.get(collection) {
            let coll = cached.clone();
            drop(cached);
            if let Some(desc) = coll.partition_map.get_partition_for_key(key, reverse, exclusive)
            {
                return Ok((coll.clone(), desc.clone()));
            }
        }
        let coll = self.refresh_collection(collection, deadline).await?;
        match coll.partition_map.get_partition_for_key(key, reverse, exclusive) {
            Some(desc) => {
                let desc = desc.clone();
                Ok((coll, desc))
            }
            None => Err(KestrelError::ServiceUnavailable(format!(
                "no partition assigned for key {key} in {collection}"
            ))),
        }
    }

    /// Fetch the collection from the CPO with bounded retries and backoff,
    /// deduplicating concurrent refreshes.
    pub async fn refresh_collection(
        &self,
        collection: &str,
        deadline: Deadline,
    ) -> KestrelResult<Arc<Collection>> {
        // Attach to an in-flight refresh when one exists.
        let rx = {
            let mut waiters = self.waiters.lock();
            if let Some(list) = waiters.get_mut(collection) {
                let (tx, rx) = oneshot::channel();
                list.push(tx);
                Some(rx)
            } else {
                waiters.insert(collection.to_string(), Vec::new());
                None
            }
        };
        if let Some(rx) = rx {
            tracing::debug!(collection, "waiting on in-flight collection refresh");
            return rx
                .await
                .unwrap_or_else(|_| Err(KestrelError::ServiceUnavailable("refresh abandoned".into())));
        }

        let mut attempts = 0u32;
        let result = loop {
            match self.service.get_collection(collection) {
                Some(coll) => break Ok(Arc::new(coll)),
                None => {
                    if deadline.is_over() {
                        break Err(KestrelError::RequestTimeout(
                            "collection refresh deadline exceeded".into(),
                        ));
                    }
                    if attempts >= self.config.partition_request_retries {
                        break Err(KestrelError::ServiceUnavailable(format!(
                            "collection {collection} not assigned at the CPO"
                        )));
                    }
                    attempts += 1;
                    let backoff = self.config.cpo_request_backoff().min(deadline.remaining());
                    tokio::time::sleep(backoff).await;
                }
            }
        };

        if let Ok(coll) = &result {
            self.cache.insert(collection.to_string(), coll.clone());
        }

        // Fulfill everyone who attached while we fetched.
        let pending = self.waiters.lock().remove(collection).unwrap_or_default();
        for tx in pending {
            let shared = match &result {
                Ok(coll) => Ok(coll.clone()),
                Err(e) => Err(KestrelError::ServiceUnavailable(format!(
                    "collection refresh failed: {e}"
                ))),
            };
            let _ = tx.send(shared);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::collection::{CollectionCapacity, StorageDriver};
    use std::time::Duration;

    fn metadata(name: &str) -> CollectionMetadata {
        CollectionMetadata {
            name: name.into(),
            hash_scheme: HashScheme::Range,
            storage_driver: StorageDriver::InMemory,
            capacity: CollectionCapacity::default(),
            retention_period: Duration::from_secs(600),
            heartbeat_deadline: Duration::from_millis(500),
        }
    }

    fn endpoints(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("local://p{i}")).collect()
    }

    #[test]
    fn test_create_collection_is_idempotent() {
        let svc = CpoService::new();
        let a = svc
            .create_collection(metadata("c"), endpoints(2), vec!["m".into(), "".into()])
            .unwrap();
        let b = svc
            .create_collection(metadata("c"), endpoints(4), vec![])
            .unwrap();
        assert_eq!(
            a.partition_map.partitions.len(),
            b.partition_map.partitions.len()
        );
    }

    #[test]
    fn test_hashed_collection() {
        let svc = CpoService::new();
        let mut meta = metadata("h");
        meta.hash_scheme = HashScheme::HashXx;
        let coll = svc.create_collection(meta, endpoints(3), vec![]).unwrap();
        assert_eq!(coll.partition_map.partitions.len(), 3);
    }

    #[test]
    fn test_register_schema_deduplicates() {
        let svc = CpoService::new();
        let schema = Schema {
            name: "kv".into(),
            version: 1,
            fields: vec![kestrel_common::schema::FieldDef::new(
                "pk",
                kestrel_common::schema::FieldType::String,
            )],
            partition_key_fields: vec![0],
            range_key_fields: vec![],
        };
        svc.register_schema("c", schema.clone()).unwrap();
        svc.register_schema("c", schema).unwrap();
        assert_eq!(svc.get_schemas("c").len(), 1);
    }

    #[tokio::test]
    async fn test_client_resolves_and_caches() {
        let svc = Arc::new(CpoService::new());
        svc.create_collection(metadata("c"), endpoints(2), vec!["m".into(), "".into()])
            .unwrap();
        let client = CpoClient::new(svc, ClientConfig::default());

        let deadline = Deadline::after(Duration::from_secs(1));
        let key = Key::new("s", "a", "");
        let (_, desc) = client
            .get_assigned_partition(deadline, "c", &key, false, false)
            .await
            .unwrap();
        assert_eq!(desc.pvid.id, 0);

        let key = Key::new("s", "z", "");
        let (_, desc) = client
            .get_assigned_partition(deadline, "c", &key, false, false)
            .await
            .unwrap();
        assert_eq!(desc.pvid.id, 1);
    }

    #[tokio::test]
    async fn test_client_unknown_collection_times_out() {
        let svc = Arc::new(CpoService::new());
        let mut config = ClientConfig::default();
        config.cpo_request_backoff_ms = 1;
        config.partition_request_retries = 2;
        let client = CpoClient::new(svc, config);

        let deadline = Deadline::after(Duration::from_millis(200));
        let err = client
            .get_assigned_partition(deadline, "missing", &Key::new("s", "a", ""), false, false)
            .await
            .unwrap_err();
        assert!(
            matches!(err, KestrelError::ServiceUnavailable(_)),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_flight() {
        let svc = Arc::new(CpoService::new());
        svc.create_collection(metadata("c"), endpoints(1), vec!["".into()])
            .unwrap();
        let client = Arc::new(CpoClient::new(svc, ClientConfig::default()));

        let deadline = Deadline::after(Duration::from_secs(1));
        let futures: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                async move { client.refresh_collection("c", deadline).await }
            })
            .collect();
        let results = futures::future::join_all(futures).await;
        assert!(results.iter().all(|r| r.is_ok()));
    }
}
