//! In-process two-partition harness for exercising the transaction module
//! end to end: a loopback peer router over a range partition map, a stub
//! timestamp source, and request builders.
#![allow(dead_code)] // not every helper is used by every test binary

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use kestrel_common::api::{
    Deadline, EndAction, PushSchemaRequest, QueryRequest, ReadRequest, TxnEndRequest,
    TxnFinalizeRequest, TxnFinalizeResponse, TxnHeartbeatRequest, TxnPushRequest,
    TxnPushResponse, WriteRequest,
};
use kestrel_common::collection::{
    CollectionCapacity, CollectionMetadata, HashScheme, PartitionMap, StorageDriver,
};
use kestrel_common::config::PartitionConfig;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::schema::{FieldDef, FieldType, FieldValue, Schema, SerializedRow};
use kestrel_common::transport::TimestampSource;
use kestrel_common::types::{Key, Mtr, Priority, Timestamp, TxnId};
use kestrel_partition::{PartitionModule, PeerRouter};
use kestrel_storage::MemPlog;

pub const COLLECTION: &str = "testcoll";
pub const SCHEMA: &str = "kv";

pub struct StubTso {
    next: AtomicU64,
}

impl StubTso {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1_000_000),
        }
    }
}

#[async_trait]
impl TimestampSource for StubTso {
    async fn now_timestamp(&self) -> KestrelResult<Timestamp> {
        Ok(Timestamp::new(
            self.next.fetch_add(1, Ordering::SeqCst),
            0,
            1,
        ))
    }
}

/// Routes push/finalize between in-process modules by key, the way the
/// cluster's routed transport does over the wire.
pub struct LoopbackRouter {
    map: PartitionMap,
    modules: Mutex<HashMap<String, Arc<PartitionModule>>>,
}

impl LoopbackRouter {
    pub fn new(map: PartitionMap) -> Arc<Self> {
        Arc::new(Self {
            map,
            modules: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, endpoint: &str, module: Arc<PartitionModule>) {
        self.modules.lock().insert(endpoint.to_string(), module);
    }

    fn resolve(&self, key: &Key) -> KestrelResult<(Arc<PartitionModule>, kestrel_common::collection::Pvid)> {
        let desc = self
            .map
            .get_partition_for_key(key, false, false)
            .ok_or_else(|| KestrelError::ServiceUnavailable("no partition for key".into()))?;
        let module = self
            .modules
            .lock()
            .get(&desc.endpoint)
            .cloned()
            .ok_or_else(|| KestrelError::ServiceUnavailable("endpoint not registered".into()))?;
        Ok((module, desc.pvid))
    }
}

#[async_trait]
impl PeerRouter for LoopbackRouter {
    async fn txn_push(
        &self,
        _collection: &str,
        routing_key: &Key,
        mut req: TxnPushRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnPushResponse> {
        let (module, pvid) = self.resolve(routing_key)?;
        req.pvid = pvid;
        module.handle_txn_push(req, deadline).await
    }

    async fn txn_finalize(
        &self,
        _collection: &str,
        routing_key: &Key,
        mut req: TxnFinalizeRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnFinalizeResponse> {
        let (module, pvid) = self.resolve(routing_key)?;
        req.pvid = pvid;
        module.handle_txn_finalize(req, deadline).await
    }
}

pub struct Cluster {
    pub map: PartitionMap,
    pub modules: Vec<Arc<PartitionModule>>,
    pub plogs: Vec<Arc<MemPlog>>,
}

impl Cluster {
    /// Module + pvid owning `key`.
    pub fn owner(&self, key: &Key) -> (Arc<PartitionModule>, kestrel_common::collection::Pvid) {
        let desc = self.map.get_partition_for_key(key, false, false).unwrap();
        let module = self
            .modules
            .iter()
            .find(|m| m.descriptor().endpoint == desc.endpoint)
            .unwrap()
            .clone();
        (module, desc.pvid)
    }
}

pub fn test_metadata() -> CollectionMetadata {
    CollectionMetadata {
        name: COLLECTION.into(),
        hash_scheme: HashScheme::Range,
        storage_driver: StorageDriver::InMemory,
        capacity: CollectionCapacity::default(),
        retention_period: Duration::from_secs(3600),
        heartbeat_deadline: Duration::from_millis(200),
    }
}

pub fn kv_schema() -> Schema {
    Schema {
        name: SCHEMA.into(),
        version: 1,
        fields: vec![
            FieldDef::new("pk", FieldType::String),
            FieldDef::new("rk", FieldType::String),
            FieldDef::new("val", FieldType::String),
        ],
        partition_key_fields: vec![0],
        range_key_fields: vec![1],
    }
}

/// Build a range-partitioned cluster and push the kv schema everywhere.
pub async fn build_cluster(range_ends: &[&str]) -> Cluster {
    build_cluster_with_config(range_ends, PartitionConfig::default()).await
}

pub async fn build_cluster_with_config(range_ends: &[&str], config: PartitionConfig) -> Cluster {
    let endpoints: Vec<String> = (0..range_ends.len())
        .map(|i| format!("local://p{i}"))
        .collect();
    let ends: Vec<String> = range_ends.iter().map(|s| s.to_string()).collect();
    let map = PartitionMap::from_range_ends(&endpoints, &ends).unwrap();
    let router = LoopbackRouter::new(map.clone());
    let tso = Arc::new(StubTso::new());

    let mut modules = Vec::new();
    let mut plogs = Vec::new();
    for desc in &map.partitions {
        let plog = Arc::new(MemPlog::new());
        let module = PartitionModule::new(
            test_metadata(),
            desc.clone(),
            config.clone(),
            plog.clone(),
            router.clone(),
            tso.clone(),
        );
        router.register(&desc.endpoint, module.clone());
        modules.push(module);
        plogs.push(plog);
    }

    for module in &modules {
        module
            .handle_push_schema(
                PushSchemaRequest {
                    collection: COLLECTION.into(),
                    schema: kv_schema(),
                },
                deadline(),
            )
            .await
            .unwrap();
    }

    Cluster { map, modules, plogs }
}

pub fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}

pub fn mtr(end: u64, priority: Priority) -> Mtr {
    Mtr {
        timestamp: Timestamp::new(end, 0, 1),
        priority,
    }
}

pub fn key(pk: &str) -> Key {
    Key::new(SCHEMA, pk, "")
}

pub fn row(pk: &str, val: &str) -> SerializedRow {
    SerializedRow::full(vec![
        FieldValue::String(pk.into()),
        FieldValue::String("".into()),
        FieldValue::String(val.into()),
    ])
}

pub fn val_of(row: &SerializedRow) -> Option<&str> {
    match row.get(2) {
        Some(FieldValue::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

impl Cluster {
    pub async fn read(&self, k: &Key, m: Mtr) -> KestrelResult<SerializedRow> {
        let (module, pvid) = self.owner(k);
        module
            .handle_read(
                ReadRequest {
                    collection: COLLECTION.into(),
                    pvid,
                    key: k.clone(),
                    mtr: m,
                },
                deadline(),
            )
            .await
            .map(|r| r.value)
    }

    /// Write through the owning partition. `trh` is the transaction's TRH
    /// key; `designate` marks the first write.
    pub async fn write(
        &self,
        k: &Key,
        value: SerializedRow,
        m: Mtr,
        trh: &Key,
        designate: bool,
    ) -> KestrelResult<()> {
        let (module, pvid) = self.owner(k);
        module
            .handle_write(
                WriteRequest {
                    collection: COLLECTION.into(),
                    pvid,
                    key: k.clone(),
                    mtr: m,
                    trh_key: trh.clone(),
                    designate_trh: designate,
                    schema_version: 1,
                    value,
                    is_delete: false,
                    reject_if_exists: false,
                    fields_for_partial_update: None,
                },
                deadline(),
            )
            .await
            .map(|_| ())
    }

    pub async fn end(
        &self,
        txn_id: &TxnId,
        action: EndAction,
        write_keys: Vec<Key>,
    ) -> KestrelResult<()> {
        let (module, pvid) = self.owner(&txn_id.trh_key);
        module
            .handle_txn_end(
                TxnEndRequest {
                    collection: COLLECTION.into(),
                    pvid,
                    txn_id: txn_id.clone(),
                    action,
                    write_keys,
                },
                deadline(),
            )
            .await
            .map(|_| ())
    }

    pub async fn heartbeat(&self, txn_id: &TxnId) -> KestrelResult<Option<kestrel_common::types::TxnState>> {
        let (module, pvid) = self.owner(&txn_id.trh_key);
        module
            .handle_txn_heartbeat(
                TxnHeartbeatRequest {
                    collection: COLLECTION.into(),
                    pvid,
                    txn_id: txn_id.clone(),
                },
                deadline(),
            )
            .await
            .map(|r| r.terminal_state)
    }

    pub async fn query(&self, req: QueryRequest) -> KestrelResult<kestrel_common::api::QueryResponse> {
        let probe = if req.start.partition_key.is_empty() {
            Key::new(SCHEMA, "", "")
        } else {
            req.start.clone()
        };
        let desc = self
            .map
            .get_partition_for_key(&probe, req.reverse, req.exclusive_start)
            .unwrap();
        let module = self
            .modules
            .iter()
            .find(|m| m.descriptor().endpoint == desc.endpoint)
            .unwrap();
        let mut req = req;
        req.pvid = desc.pvid;
        module.handle_query(req, deadline()).await
    }

    /// Write one committed value: a single-key transaction, written and
    /// ended inline.
    pub async fn put_committed(&self, k: &Key, val: &str, end_ts: u64) -> KestrelResult<()> {
        let m = mtr(end_ts, Priority::MEDIUM);
        let txn_id = TxnId {
            trh_key: k.clone(),
            mtr: m,
        };
        self.write(k, row(&k.partition_key, val), m, k, true).await?;
        self.end(&txn_id, EndAction::Commit, vec![k.clone()]).await
    }
}

pub fn txn(trh: &Key, end: u64, priority: Priority) -> (TxnId, Mtr) {
    let m = mtr(end, priority);
    (
        TxnId {
            trh_key: trh.clone(),
            mtr: m,
        },
        m,
    )
}
