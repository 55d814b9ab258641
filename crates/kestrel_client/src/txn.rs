use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use kestrel_cluster::{routed_request, CpoClient, TsoClient};
use kestrel_common::api::{
    Deadline, EndAction, FieldPredicate, QueryRequest, QueryResponse, ReadRequest, TxnEndRequest,
    TxnHeartbeatRequest, WriteRequest,
};
use kestrel_common::config::ClientConfig;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::schema::SerializedRow;
use kestrel_common::transport::PartitionTransport;
use kestrel_common::types::{Key, Mtr, Priority, TxnId};

/// Options for a new transaction.
#[derive(Debug, Clone)]
pub struct TxnOptions {
    pub priority: Priority,
    /// Deadline applied to each routed operation.
    pub op_timeout: Duration,
}

impl Default for TxnOptions {
    fn default() -> Self {
        Self {
            priority: Priority::MEDIUM,
            op_timeout: Duration::from_secs(1),
        }
    }
}

/// Write flags mirroring the write verb.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub is_delete: bool,
    pub reject_if_exists: bool,
    pub fields_for_partial_update: Option<Vec<u32>>,
}

/// One page of a scan.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub start: Key,
    pub end: Key,
    pub reverse: bool,
    pub exclusive_start: bool,
    pub filter: Vec<FieldPredicate>,
    pub projection: Vec<String>,
    pub limit: Option<usize>,
}

/// Entry point for transactions: holds the routing cache, the timestamp
/// client and the transport.
pub struct KestrelClient {
    cpo: Arc<CpoClient>,
    tso: Arc<TsoClient>,
    transport: Arc<dyn PartitionTransport>,
    config: ClientConfig,
}

impl KestrelClient {
    pub fn new(
        cpo: Arc<CpoClient>,
        tso: Arc<TsoClient>,
        transport: Arc<dyn PartitionTransport>,
        config: ClientConfig,
    ) -> Self {
        Self {
            cpo,
            tso,
            transport,
            config,
        }
    }

    /// Begin a transaction: acquire its snapshot timestamp from the TSO.
    pub async fn begin(&self, options: TxnOptions) -> KestrelResult<Txn> {
        let timestamp = self.tso.next_timestamp()?;
        Ok(Txn {
            cpo: self.cpo.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            mtr: Mtr {
                timestamp,
                priority: options.priority,
            },
            op_timeout: options.op_timeout,
            trh: None,
            write_set: BTreeSet::new(),
            heartbeat: None,
            ended: false,
        })
    }
}

struct HeartbeatTask {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A live transaction. The first write designates its TRH and starts the
/// heartbeat; `end` (or `commit`/`abort`) settles it. Dropping a transaction
/// without ending it stops the heartbeat and leaves the record to expire at
/// its TRH.
pub struct Txn {
    cpo: Arc<CpoClient>,
    transport: Arc<dyn PartitionTransport>,
    config: ClientConfig,
    mtr: Mtr,
    op_timeout: Duration,
    trh: Option<Key>,
    write_set: BTreeSet<Key>,
    heartbeat: Option<HeartbeatTask>,
    ended: bool,
}

impl Txn {
    pub fn mtr(&self) -> Mtr {
        self.mtr
    }

    pub fn txn_id(&self) -> Option<TxnId> {
        self.trh.as_ref().map(|trh| TxnId {
            trh_key: trh.clone(),
            mtr: self.mtr,
        })
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.op_timeout)
    }

    /// Read a key at this transaction's snapshot. `None` when absent (or
    /// deleted as of the snapshot).
    pub async fn read(&self, collection: &str, key: &Key) -> KestrelResult<Option<SerializedRow>> {
        let deadline = self.deadline();
        let result = routed_request(
            &self.cpo,
            collection,
            key,
            false,
            false,
            deadline,
            |endpoint, pvid| {
                let req = ReadRequest {
                    collection: collection.to_string(),
                    pvid,
                    key: key.clone(),
                    mtr: self.mtr,
                };
                let transport = self.transport.clone();
                async move { transport.read(&endpoint, req, deadline).await }
            },
        )
        .await;
        match result {
            Ok(resp) => Ok(Some(resp.value)),
            Err(KestrelError::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write(
        &mut self,
        collection: &str,
        key: &Key,
        value: SerializedRow,
        schema_version: u32,
    ) -> KestrelResult<()> {
        self.write_with(collection, key, value, schema_version, WriteOptions::default())
            .await
    }

    pub async fn delete(&mut self, collection: &str, key: &Key, schema_version: u32) -> KestrelResult<()> {
        self.write_with(
            collection,
            key,
            SerializedRow::default(),
            schema_version,
            WriteOptions {
                is_delete: true,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn write_with(
        &mut self,
        collection: &str,
        key: &Key,
        value: SerializedRow,
        schema_version: u32,
        options: WriteOptions,
    ) -> KestrelResult<()> {
        if self.ended {
            return Err(KestrelError::OperationNotAllowed(
                "transaction already ended".into(),
            ));
        }
        let designate = self.trh.is_none();
        let trh_key = self.trh.clone().unwrap_or_else(|| key.clone());
        let deadline = self.deadline();

        routed_request(
            &self.cpo,
            collection,
            key,
            false,
            false,
            deadline,
            |endpoint, pvid| {
                let req = WriteRequest {
                    collection: collection.to_string(),
                    pvid,
                    key: key.clone(),
                    mtr: self.mtr,
                    trh_key: trh_key.clone(),
                    designate_trh: designate,
                    schema_version,
                    value: value.clone(),
                    is_delete: options.is_delete,
                    reject_if_exists: options.reject_if_exists,
                    fields_for_partial_update: options.fields_for_partial_update.clone(),
                };
                let transport = self.transport.clone();
                async move { transport.write(&endpoint, req, deadline).await }
            },
        )
        .await?;

        self.write_set.insert(key.clone());
        if designate {
            self.trh = Some(trh_key);
            self.start_heartbeat(collection);
        }
        Ok(())
    }

    /// One scan page against the partition owning the start of the range.
    pub async fn query(
        &self,
        collection: &str,
        params: &QueryParams,
    ) -> KestrelResult<QueryResponse> {
        let deadline = self.deadline();
        routed_request(
            &self.cpo,
            collection,
            &params.start,
            params.reverse,
            params.exclusive_start,
            deadline,
            |endpoint, pvid| {
                let req = QueryRequest {
                    collection: collection.to_string(),
                    pvid,
                    start: params.start.clone(),
                    end: params.end.clone(),
                    mtr: self.mtr,
                    reverse: params.reverse,
                    exclusive_start: params.exclusive_start,
                    filter: params.filter.clone(),
                    projection: params.projection.clone(),
                    limit: params.limit,
                };
                let transport = self.transport.clone();
                async move { transport.query(&endpoint, req, deadline).await }
            },
        )
        .await
    }

    /// Drive a scan to completion, following continuation tokens across
    /// pages and partitions.
    pub async fn query_all(
        &self,
        collection: &str,
        params: QueryParams,
    ) -> KestrelResult<Vec<SerializedRow>> {
        let mut rows = Vec::new();
        let mut params = params;
        loop {
            let page = self.query(collection, &params).await?;
            rows.extend(page.rows);
            match page.next_to_scan {
                Some(next) => {
                    params.start = next;
                    params.exclusive_start = page.exclusive_token;
                }
                None => return Ok(rows),
            }
        }
    }

    pub async fn commit(self, collection: &str) -> KestrelResult<()> {
        self.end(collection, EndAction::Commit).await
    }

    pub async fn abort(self, collection: &str) -> KestrelResult<()> {
        self.end(collection, EndAction::Abort).await
    }

    /// Settle the transaction at its TRH. Read-only transactions settle
    /// locally; SI-abort statuses surfaced by earlier operations require
    /// `EndAction::Abort` here.
    pub async fn end(mut self, collection: &str, action: EndAction) -> KestrelResult<()> {
        self.ended = true;
        self.stop_heartbeat().await;
        let Some(txn_id) = self.txn_id() else {
            return Ok(());
        };
        let write_keys: Vec<Key> = self.write_set.iter().cloned().collect();
        // The end settles remote finalization too; give it room.
        let deadline = Deadline::after(self.op_timeout * 4);
        routed_request(
            &self.cpo,
            collection,
            &txn_id.trh_key,
            false,
            false,
            deadline,
            |endpoint, pvid| {
                let req = TxnEndRequest {
                    collection: collection.to_string(),
                    pvid,
                    txn_id: txn_id.clone(),
                    action,
                    write_keys: write_keys.clone(),
                };
                let transport = self.transport.clone();
                async move { transport.txn_end(&endpoint, req, deadline).await }
            },
        )
        .await
        .map(|_| ())
    }

    fn start_heartbeat(&mut self, collection: &str) {
        let Some(txn_id) = self.txn_id() else { return };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(heartbeat_loop(
            self.cpo.clone(),
            self.transport.clone(),
            self.op_timeout,
            collection.to_string(),
            txn_id,
            shutdown_rx,
        ));
        self.heartbeat = Some(HeartbeatTask { shutdown, task });
    }

    async fn stop_heartbeat(&mut self) {
        if let Some(hb) = self.heartbeat.take() {
            let _ = hb.shutdown.send(true);
            let _ = hb.task.await;
        }
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if let Some(hb) = self.heartbeat.take() {
            let _ = hb.shutdown.send(true);
            hb.task.abort();
        }
        if !self.ended && self.trh.is_some() {
            // The record will expire at its TRH and be force-aborted there.
            tracing::warn!(mtr = %self.mtr, "transaction dropped without end");
        }
    }
}

/// Beat at a quarter of the collection's heartbeat deadline until told to
/// stop or the record reports a terminal state.
async fn heartbeat_loop(
    cpo: Arc<CpoClient>,
    transport: Arc<dyn PartitionTransport>,
    op_timeout: Duration,
    collection: String,
    txn_id: TxnId,
    mut shutdown: watch::Receiver<bool>,
) {
    let resolve_deadline = Deadline::after(op_timeout);
    let period = match cpo
        .get_assigned_partition(resolve_deadline, &collection, &txn_id.trh_key, false, false)
        .await
    {
        Ok((coll, _)) => coll.metadata.heartbeat_deadline / 4,
        Err(_) => Duration::from_millis(100),
    };
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(5)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let deadline = Deadline::after(op_timeout);
                let beat = routed_request(
                    &cpo,
                    &collection,
                    &txn_id.trh_key,
                    false,
                    false,
                    deadline,
                    |endpoint, pvid| {
                        let req = TxnHeartbeatRequest {
                            collection: collection.clone(),
                            pvid,
                            txn_id: txn_id.clone(),
                        };
                        let transport = transport.clone();
                        async move { transport.txn_heartbeat(&endpoint, req, deadline).await }
                    },
                )
                .await;
                match beat {
                    Ok(resp) if resp.terminal_state.is_some() => {
                        tracing::debug!(
                            txn = %txn_id,
                            state = ?resp.terminal_state,
                            "transaction terminal; heartbeat stopping"
                        );
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(txn = %txn_id, error = %e, "heartbeat failed");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
