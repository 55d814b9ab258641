use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use kestrel_common::api::{
    Deadline, EndAction, PushSchemaRequest, PushSchemaResponse, ReadRequest, ReadResponse,
    TxnEndRequest, TxnEndResponse, TxnFinalizeRequest, TxnFinalizeResponse, TxnHeartbeatRequest,
    TxnHeartbeatResponse, TxnPushRequest, TxnPushResponse,
};
use kestrel_common::collection::{CollectionMetadata, PartitionDescriptor, Pvid};
use kestrel_common::config::PartitionConfig;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::schema::Schema;
use kestrel_common::transport::TimestampSource;
use kestrel_common::types::{DataRecord, Key, Mtr, Timestamp, TxnId, TxnState};
use kestrel_storage::plog::{Plog, PlogEntry};
use kestrel_storage::{Indexer, ReadCache};
use kestrel_txn::TxnManager;

use crate::peers::PeerRouter;
use crate::push::challenger_wins;

/// Mutable state of one partition. Accessed only inside short critical
/// sections; the lock is never held across a suspension point, and lookups
/// are redone by key after every resume.
pub struct PartitionState {
    pub indexer: Indexer,
    pub read_cache: ReadCache,
    pub txns: TxnManager,
}

/// The per-partition snapshot-isolation transaction module.
///
/// Owns the multi-version indexer, the read cache and the transaction-record
/// table for one partition, and serves the verb handlers. Conflicts are
/// arbitrated through the push protocol at the incumbent's TRH partition,
/// reached through the peer router (which may route back to this partition).
pub struct PartitionModule {
    pub(crate) cmeta: CollectionMetadata,
    pub(crate) partition: PartitionDescriptor,
    pub(crate) config: PartitionConfig,
    state: Mutex<PartitionState>,
    schemas: RwLock<HashMap<String, BTreeMap<u32, Arc<Schema>>>>,
    /// Requests with timestamps below this boundary are rejected.
    retention_ts: RwLock<Timestamp>,
    pub(crate) plog: Arc<dyn Plog>,
    pub(crate) peers: Arc<dyn PeerRouter>,
    tso: Arc<dyn TimestampSource>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PartitionModule {
    pub fn new(
        cmeta: CollectionMetadata,
        partition: PartitionDescriptor,
        config: PartitionConfig,
        plog: Arc<dyn Plog>,
        peers: Arc<dyn PeerRouter>,
        tso: Arc<dyn TimestampSource>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(PartitionState {
                indexer: Indexer::new(),
                read_cache: ReadCache::new(config.read_cache_capacity),
                txns: TxnManager::new(cmeta.heartbeat_deadline),
            }),
            schemas: RwLock::new(HashMap::new()),
            retention_ts: RwLock::new(Timestamp::ZERO),
            cmeta,
            partition,
            config,
            plog,
            peers,
            tso,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn collection_name(&self) -> &str {
        &self.cmeta.name
    }

    pub fn descriptor(&self) -> &PartitionDescriptor {
        &self.partition
    }

    /// Spawn the heartbeat sweeper and the retention refresher.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Self::heartbeat_sweep_loop(
            Arc::clone(self),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(Self::retention_refresh_loop(
            Arc::clone(self),
            self.shutdown.subscribe(),
        )));
        tracing::info!(
            collection = %self.cmeta.name,
            partition = self.partition.pvid.id,
            "partition module started"
        );
    }

    /// Stop background tasks and wait for them to exit.
    pub async fn graceful_stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(
            collection = %self.cmeta.name,
            partition = self.partition.pvid.id,
            "partition module stopped"
        );
    }

    // ── validation ───────────────────────────────────────────────────────

    pub(crate) fn validate_partition(
        &self,
        collection: &str,
        pvid: &Pvid,
        key: &Key,
    ) -> KestrelResult<()> {
        if collection != self.cmeta.name
            || *pvid != self.partition.pvid
            || !self.partition.owns(key)
        {
            return Err(KestrelError::RefreshCollection(collection.to_string()));
        }
        Ok(())
    }

    pub(crate) fn validate_retention(&self, mtr: &Mtr) -> KestrelResult<()> {
        let retention = *self.retention_ts.read();
        if mtr.timestamp.compare_certain(&retention).is_lt() {
            return Err(KestrelError::AbortRequestTooOld(format!(
                "{} is below the retention boundary {retention}",
                mtr.timestamp
            )));
        }
        Ok(())
    }

    pub(crate) fn check_deadline(&self, deadline: &Deadline) -> KestrelResult<()> {
        if deadline.is_over() {
            return Err(KestrelError::RequestTimeout(
                "request deadline expired at partition".into(),
            ));
        }
        Ok(())
    }

    fn validate_read_request(&self, collection: &str, pvid: &Pvid, key: &Key, mtr: &Mtr) -> KestrelResult<()> {
        self.validate_partition(collection, pvid, key)?;
        if key.partition_key.is_empty() {
            return Err(KestrelError::BadParameter(
                "missing partition key in read-type request".into(),
            ));
        }
        self.validate_retention(mtr)?;
        if !self.schema_known(&key.schema_name) {
            return Err(KestrelError::SchemaNotFound {
                name: key.schema_name.clone(),
                version: 0,
            });
        }
        Ok(())
    }

    pub(crate) fn schema_known(&self, name: &str) -> bool {
        self.schemas.read().contains_key(name)
    }

    pub(crate) fn schema(&self, name: &str, version: u32) -> KestrelResult<Arc<Schema>> {
        self.schemas
            .read()
            .get(name)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| KestrelError::SchemaNotFound {
                name: name.to_string(),
                version,
            })
    }

    // ── Read ─────────────────────────────────────────────────────────────

    /// Serve a read, pushing past at most `push_retries` blocking write
    /// intents.
    pub async fn handle_read(
        &self,
        req: ReadRequest,
        deadline: Deadline,
    ) -> KestrelResult<ReadResponse> {
        self.validate_read_request(&req.collection, &req.pvid, &req.key, &req.mtr)?;

        let mut retries = self.config.push_retries;
        loop {
            self.check_deadline(&deadline)?;
            let incumbent = {
                let mut state = self.state.lock();
                state
                    .read_cache
                    .observe(req.key.clone(), req.key.clone(), req.mtr.timestamp);
                match state.indexer.visible_at(&req.key, &req.mtr.timestamp) {
                    None => return Err(KestrelError::KeyNotFound),
                    Some(rec) if !rec.is_write_intent() || rec.txn_id.mtr == req.mtr => {
                        // Committed version, or this transaction's own intent.
                        if rec.is_tombstone {
                            return Err(KestrelError::KeyNotFound);
                        }
                        return Ok(ReadResponse {
                            value: rec.value.clone(),
                            schema_version: rec.schema_version,
                            timestamp: rec.timestamp(),
                        });
                    }
                    Some(rec) => rec.txn_id.clone(),
                }
            };
            if retries == 0 {
                return Err(KestrelError::AbortConflict(incumbent));
            }
            retries -= 1;
            if !self
                .do_push(&req.collection, &req.key, incumbent.clone(), req.mtr, deadline)
                .await?
            {
                return Err(KestrelError::AbortConflict(incumbent));
            }
            // Push won: the intent is gone, retry the lookup.
        }
    }

    // ── Push ─────────────────────────────────────────────────────────────

    /// Execute a push at the incumbent's TRH partition on behalf of a blocked
    /// challenger. Returns true iff the challenger may proceed, in which case
    /// the triggering write intent has been cleaned up locally.
    pub(crate) async fn do_push(
        &self,
        collection: &str,
        key: &Key,
        incumbent: TxnId,
        challenger_mtr: Mtr,
        deadline: Deadline,
    ) -> KestrelResult<bool> {
        tracing::debug!(%incumbent, challenger = %challenger_mtr, %key, "push");
        let req = TxnPushRequest {
            collection: collection.to_string(),
            pvid: Pvid::default(), // filled in by the router
            key: incumbent.trh_key.clone(),
            incumbent_txn_id: incumbent.clone(),
            challenger_mtr,
        };
        let resp = self
            .peers
            .txn_push(collection, &incumbent.trh_key, req, deadline)
            .await?;
        if resp.challenger_proceeds {
            // The incumbent is aborted; remove the intent that blocked us.
            self.apply_finalize(key, &incumbent, EndAction::Abort).await?;
        }
        Ok(resp.challenger_proceeds)
    }

    /// Arbitrate a push for a transaction anchored at this partition.
    ///
    /// The decision is made atomically under the TR and is monotonic, so
    /// repeating the push returns the same answer.
    pub async fn handle_txn_push(
        &self,
        req: TxnPushRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnPushResponse> {
        self.validate_partition(&req.collection, &req.pvid, &req.key)?;
        self.validate_retention(&req.challenger_mtr)?;
        self.check_deadline(&deadline)?;

        let (response, to_persist) = self.decide_txn_push(&req)?;
        if let Some(entry) = to_persist {
            self.plog.append(entry).await?;
            self.plog.flush().await?;
        }
        Ok(response)
    }

    /// Compute the push decision under the TR lock, without ever holding the
    /// lock across a suspension point.
    fn decide_txn_push(
        &self,
        req: &TxnPushRequest,
    ) -> KestrelResult<(TxnPushResponse, Option<PlogEntry>)> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let (incumbent_state, created) = match state.txns.get(&req.incumbent_txn_id) {
            Some(r) => (r.state, false),
            None => {
                // Never seen (or already finalized and deleted): pin it
                // aborted so a late commit attempt cannot succeed.
                let rec = state
                    .txns
                    .create_force_aborted(req.incumbent_txn_id.clone(), now);
                (rec.state, true)
            }
        };
        if created {
            let entry = PlogEntry::TxnStateChange {
                txn_id: req.incumbent_txn_id.clone(),
                state: incumbent_state,
            };
            return Ok((
                TxnPushResponse {
                    incumbent_state,
                    challenger_proceeds: incumbent_state != TxnState::Committed,
                },
                Some(entry),
            ));
        }
        let (response, to_persist) = match incumbent_state {
            TxnState::Committed => (
                TxnPushResponse {
                    incumbent_state,
                    challenger_proceeds: false,
                },
                None,
            ),
            TxnState::Aborted | TxnState::ForceAborted | TxnState::Deleted => (
                TxnPushResponse {
                    incumbent_state,
                    challenger_proceeds: true,
                },
                None,
            ),
            TxnState::InProgress => {
                if challenger_wins(&req.incumbent_txn_id.mtr, &req.challenger_mtr) {
                    state
                        .txns
                        .transition(&req.incumbent_txn_id, TxnState::ForceAborted)?;
                    (
                        TxnPushResponse {
                            incumbent_state: TxnState::ForceAborted,
                            challenger_proceeds: true,
                        },
                        Some(PlogEntry::TxnStateChange {
                            txn_id: req.incumbent_txn_id.clone(),
                            state: TxnState::ForceAborted,
                        }),
                    )
                } else {
                    (
                        TxnPushResponse {
                            incumbent_state,
                            challenger_proceeds: false,
                        },
                        None,
                    )
                }
            }
        };
        Ok((response, to_persist))
    }

    // ── TxnEnd ───────────────────────────────────────────────────────────

    /// Commit or abort a transaction at its TRH partition, then finalize its
    /// write intents and delete the record once every finalize acks.
    pub async fn handle_txn_end(
        &self,
        req: TxnEndRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnEndResponse> {
        self.validate_partition(&req.collection, &req.pvid, &req.txn_id.trh_key)?;
        self.check_deadline(&deadline)?;

        let (final_action, commit_rejected) = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let current = match state.txns.get(&req.txn_id) {
                Some(r) => r.state,
                None => {
                    // Unknown or already deleted. Abort is trivially done;
                    // commit cannot be honored.
                    return match req.action {
                        EndAction::Abort => Ok(TxnEndResponse::default()),
                        EndAction::Commit => Err(KestrelError::OperationNotAllowed(format!(
                            "commit for unknown transaction {}",
                            req.txn_id
                        ))),
                    };
                }
            };
            state
                .txns
                .merge_write_keys(&req.txn_id, req.write_keys.iter().cloned());

            match (current, req.action) {
                (TxnState::InProgress, EndAction::Commit) => {
                    if state.txns.is_heartbeat_fresh(&req.txn_id, now) {
                        state.txns.transition(&req.txn_id, TxnState::Committed)?;
                        (EndAction::Commit, false)
                    } else {
                        // Expired under the sweeper's nose; treat as pushed.
                        state
                            .txns
                            .transition(&req.txn_id, TxnState::ForceAborted)?;
                        state.txns.transition(&req.txn_id, TxnState::Aborted)?;
                        (EndAction::Abort, true)
                    }
                }
                (TxnState::InProgress, EndAction::Abort) => {
                    state.txns.transition(&req.txn_id, TxnState::Aborted)?;
                    (EndAction::Abort, false)
                }
                (TxnState::ForceAborted, action) => {
                    // The push protocol already decided; commit is rewritten.
                    state.txns.transition(&req.txn_id, TxnState::Aborted)?;
                    (EndAction::Abort, action == EndAction::Commit)
                }
                (TxnState::Committed, EndAction::Commit) => (EndAction::Commit, false),
                (TxnState::Aborted, EndAction::Abort) => (EndAction::Abort, false),
                (TxnState::Committed, EndAction::Abort)
                | (TxnState::Aborted, EndAction::Commit) => {
                    return Err(KestrelError::OperationNotAllowed(format!(
                        "transaction {} already ended as {current}",
                        req.txn_id
                    )));
                }
                (TxnState::Deleted, _) => {
                    return Ok(TxnEndResponse::default());
                }
            }
        };

        let terminal = match final_action {
            EndAction::Commit => TxnState::Committed,
            EndAction::Abort => TxnState::Aborted,
        };
        self.plog
            .append(PlogEntry::TxnStateChange {
                txn_id: req.txn_id.clone(),
                state: terminal,
            })
            .await?;
        self.plog.flush().await?;

        self.finalize_write_set(&req.collection, &req.txn_id, final_action, deadline)
            .await;

        if commit_rejected {
            return Err(KestrelError::OperationNotAllowed(format!(
                "transaction {} was force-aborted; commit rewritten to abort",
                req.txn_id
            )));
        }
        Ok(TxnEndResponse::default())
    }

    /// Send finalize to every partition holding one of the transaction's
    /// write intents; delete the record once all of them ack. A failed
    /// fan-out leaves the record terminal so a retried TxnEnd repeats it.
    async fn finalize_write_set(
        &self,
        collection: &str,
        txn_id: &TxnId,
        action: EndAction,
        deadline: Deadline,
    ) {
        let write_keys: Vec<Key> = {
            let state = self.state.lock();
            match state.txns.get(txn_id) {
                Some(r) => r.write_keys.iter().cloned().collect(),
                None => return,
            }
        };

        let calls = write_keys.iter().map(|key| {
            let req = TxnFinalizeRequest {
                collection: collection.to_string(),
                pvid: Pvid::default(),
                key: key.clone(),
                txn_id: txn_id.clone(),
                action,
            };
            self.peers.txn_finalize(collection, key, req, deadline)
        });
        let results = futures::future::join_all(calls).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::warn!(
                txn = %txn_id,
                failed,
                total = write_keys.len(),
                "finalize fan-out incomplete; record kept for retry"
            );
            return;
        }

        // All intents finalized: the record may now be durably deleted.
        if let Err(e) = self
            .plog
            .append(PlogEntry::TxnRecordDelete {
                txn_id: txn_id.clone(),
            })
            .await
            .and(self.plog.flush().await)
        {
            tracing::warn!(txn = %txn_id, error = %e, "txn record delete not persisted");
            return;
        }
        let mut state = self.state.lock();
        if state.txns.transition(txn_id, TxnState::Deleted).is_ok() {
            state.txns.remove(txn_id);
        }
    }

    // ── TxnHeartbeat ─────────────────────────────────────────────────────

    pub async fn handle_txn_heartbeat(
        &self,
        req: TxnHeartbeatRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnHeartbeatResponse> {
        self.validate_partition(&req.collection, &req.pvid, &req.txn_id.trh_key)?;
        self.validate_retention(&req.txn_id.mtr)?;
        self.check_deadline(&deadline)?;

        let mut state = self.state.lock();
        match state.txns.heartbeat(&req.txn_id, Instant::now()) {
            // Record is gone: it was finalized and deleted.
            None => Ok(TxnHeartbeatResponse {
                terminal_state: Some(TxnState::Deleted),
            }),
            Some(terminal) => Ok(TxnHeartbeatResponse {
                terminal_state: terminal,
            }),
        }
    }

    // ── TxnFinalize ──────────────────────────────────────────────────────

    /// Finalize one write intent at its holding partition: flip to committed
    /// in place, or pop it. Idempotent when the intent is absent or already
    /// resolved.
    pub async fn handle_txn_finalize(
        &self,
        req: TxnFinalizeRequest,
        deadline: Deadline,
    ) -> KestrelResult<TxnFinalizeResponse> {
        self.validate_partition(&req.collection, &req.pvid, &req.key)?;
        self.check_deadline(&deadline)?;
        self.apply_finalize(&req.key, &req.txn_id, req.action).await?;
        Ok(TxnFinalizeResponse::default())
    }

    /// Shared finalize path, also used to clean up a pushed-out intent.
    /// Persists the action before mutating, then re-verifies the front (the
    /// lock was released across the append).
    pub(crate) async fn apply_finalize(
        &self,
        key: &Key,
        txn_id: &TxnId,
        action: EndAction,
    ) -> KestrelResult<()> {
        let needs_action = {
            let state = self.state.lock();
            matches!(
                state.indexer.latest(key),
                Some(rec) if rec.is_write_intent() && rec.txn_id == *txn_id
            )
        };
        if !needs_action {
            return Ok(());
        }

        self.plog
            .append(PlogEntry::Finalize {
                key: key.clone(),
                txn_id: txn_id.clone(),
                action,
            })
            .await?;
        self.plog.flush().await?;

        let mut state = self.state.lock();
        let still_ours = matches!(
            state.indexer.latest(key),
            Some(rec) if rec.is_write_intent() && rec.txn_id == *txn_id
        );
        if still_ours {
            match action {
                EndAction::Commit => {
                    state.indexer.commit_front(key, txn_id);
                }
                EndAction::Abort => {
                    state.indexer.pop_front(key);
                }
            }
        }
        Ok(())
    }

    // ── PushSchema ───────────────────────────────────────────────────────

    /// Register a schema version pushed by the control plane. Idempotent.
    pub async fn handle_push_schema(
        &self,
        req: PushSchemaRequest,
        deadline: Deadline,
    ) -> KestrelResult<PushSchemaResponse> {
        if req.collection != self.cmeta.name {
            return Err(KestrelError::RefreshCollection(req.collection));
        }
        self.check_deadline(&deadline)?;
        req.schema
            .validate()
            .map_err(KestrelError::BadParameter)?;
        let mut schemas = self.schemas.write();
        schemas
            .entry(req.schema.name.clone())
            .or_default()
            .insert(req.schema.version, Arc::new(req.schema));
        Ok(PushSchemaResponse::default())
    }

    // ── background tasks ─────────────────────────────────────────────────

    async fn heartbeat_sweep_loop(module: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(module.config.heartbeat_sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = {
                        let state = module.state.lock();
                        state.txns.expired(Instant::now())
                    };
                    for txn_id in expired {
                        let transitioned = {
                            let mut state = module.state.lock();
                            // Re-check: a TxnEnd may have raced the sweep.
                            state
                                .txns
                                .get(&txn_id)
                                .map(|r| r.state == TxnState::InProgress)
                                .unwrap_or(false)
                                && state
                                    .txns
                                    .transition(&txn_id, TxnState::ForceAborted)
                                    .is_ok()
                        };
                        if transitioned {
                            tracing::info!(txn = %txn_id, "heartbeat expired; force-aborted");
                            let entry = PlogEntry::TxnStateChange {
                                txn_id,
                                state: TxnState::ForceAborted,
                            };
                            if let Err(e) = module.plog.append(entry).await {
                                tracing::warn!(error = %e, "heartbeat sweep persist failed");
                            } else {
                                let _ = module.plog.flush().await;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn retention_refresh_loop(module: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(module.config.retention_refresh_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match module.tso.now_timestamp().await {
                        Ok(now) => {
                            let boundary = now.sub_duration(module.cmeta.retention_period);
                            {
                                let mut retention = module.retention_ts.write();
                                if boundary.compare_certain(&retention).is_gt() {
                                    *retention = boundary;
                                }
                            }
                            let trimmed = {
                                let mut state = module.state.lock();
                                state.indexer.trim_below(&boundary)
                            };
                            if trimmed > 0 {
                                tracing::debug!(trimmed, %boundary, "retention trim");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "retention refresh failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    // ── inspection (tests and debugging, not transaction processing) ─────

    /// All versions currently held for a key, newest first.
    pub fn inspect_versions(&self, key: &Key) -> Vec<DataRecord> {
        let state = self.state.lock();
        state
            .indexer
            .versions(key)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The state and known write set of a transaction anchored here.
    pub fn inspect_txn(&self, txn_id: &TxnId) -> Option<(TxnState, Vec<Key>)> {
        let state = self.state.lock();
        state
            .txns
            .get(txn_id)
            .map(|r| (r.state, r.write_keys.iter().cloned().collect()))
    }

    /// Transaction counters for this partition.
    pub fn txn_stats(&self) -> kestrel_txn::TxnStatsSnapshot {
        self.state.lock().txns.snapshot()
    }

    /// The current retention boundary.
    pub fn retention_timestamp(&self) -> Timestamp {
        *self.retention_ts.read()
    }

    /// Force the retention boundary (tests only).
    pub fn set_retention_timestamp(&self, ts: Timestamp) {
        *self.retention_ts.write() = ts;
    }

    /// Verify the structural indexer invariants (tests only).
    pub fn check_invariants(&self) -> Result<(), String> {
        self.state.lock().indexer.check_invariants()
    }

    pub(crate) fn lock_state(&self) -> parking_lot::MutexGuard<'_, PartitionState> {
        self.state.lock()
    }
}
