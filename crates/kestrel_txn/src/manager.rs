use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::{Key, TxnId, TxnState};

/// The per-transaction state row held at the TRH partition.
#[derive(Debug, Clone)]
pub struct TxnRecord {
    pub txn_id: TxnId,
    pub state: TxnState,
    /// Every key this transaction holds a write intent on, as known to the
    /// TRH (local writes plus the client-reported set at end time).
    pub write_keys: BTreeSet<Key>,
    pub last_heartbeat: Instant,
}

/// Aggregate counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnStatsSnapshot {
    pub created: u64,
    pub committed: u64,
    pub aborted: u64,
    pub force_aborted: u64,
    pub deleted: u64,
    pub active_count: usize,
}

/// Owner of the transaction-record table for one partition.
///
/// All methods run under the partition's critical section; the caller makes
/// every transition durable before acknowledging it.
#[derive(Debug)]
pub struct TxnManager {
    records: HashMap<TxnId, TxnRecord>,
    heartbeat_deadline: Duration,
    stats: TxnStatsSnapshot,
}

impl TxnManager {
    pub fn new(heartbeat_deadline: Duration) -> Self {
        Self {
            records: HashMap::new(),
            heartbeat_deadline,
            stats: TxnStatsSnapshot::default(),
        }
    }

    pub fn get(&self, txn_id: &TxnId) -> Option<&TxnRecord> {
        self.records.get(txn_id)
    }

    pub fn get_mut(&mut self, txn_id: &TxnId) -> Option<&mut TxnRecord> {
        self.records.get_mut(txn_id)
    }

    /// Create the record for a newly designated transaction. Idempotent for
    /// an existing InProgress record (a retried first write).
    pub fn create(&mut self, txn_id: TxnId, now: Instant) -> KestrelResult<&mut TxnRecord> {
        if let Some(existing) = self.records.get(&txn_id) {
            if existing.state != TxnState::InProgress {
                return Err(KestrelError::OperationNotAllowed(format!(
                    "transaction {txn_id} already exists in state {}",
                    existing.state
                )));
            }
        } else {
            self.stats.created += 1;
            self.records.insert(
                txn_id.clone(),
                TxnRecord {
                    txn_id: txn_id.clone(),
                    state: TxnState::InProgress,
                    write_keys: BTreeSet::new(),
                    last_heartbeat: now,
                },
            );
        }
        Ok(self.records.get_mut(&txn_id).expect("just inserted"))
    }

    /// Create a record pinned in ForceAborted. Used when a push arrives for a
    /// transaction this partition has never seen (or whose record was already
    /// finalized and deleted): a later commit attempt must fail.
    pub fn create_force_aborted(&mut self, txn_id: TxnId, now: Instant) -> &mut TxnRecord {
        self.stats.force_aborted += 1;
        self.records
            .entry(txn_id.clone())
            .or_insert_with(|| TxnRecord {
                txn_id,
                state: TxnState::ForceAborted,
                write_keys: BTreeSet::new(),
                last_heartbeat: now,
            })
    }

    /// Apply a state transition, enforcing the lifecycle graph:
    ///
    /// ```text
    /// InProgress ─commit──────────▶ Committed ──finalize-all──▶ Deleted
    ///     │ └──abort─────────────▶ Aborted   ──finalize-all──▶ Deleted
    ///     └──push / hb-timeout──▶ ForceAborted ──end──▶ Aborted
    /// ```
    ///
    /// Re-applying the current state is idempotent and returns it unchanged.
    pub fn transition(&mut self, txn_id: &TxnId, to: TxnState) -> KestrelResult<TxnState> {
        let record = self
            .records
            .get_mut(txn_id)
            .ok_or_else(|| KestrelError::OperationNotAllowed(format!("unknown txn {txn_id}")))?;
        let from = record.state;
        if from == to {
            return Ok(to);
        }
        let legal = matches!(
            (from, to),
            (TxnState::InProgress, TxnState::Committed)
                | (TxnState::InProgress, TxnState::Aborted)
                | (TxnState::InProgress, TxnState::ForceAborted)
                | (TxnState::ForceAborted, TxnState::Aborted)
                | (TxnState::Committed, TxnState::Deleted)
                | (TxnState::Aborted, TxnState::Deleted)
        );
        if !legal {
            return Err(KestrelError::InvalidTransition {
                txn_id: txn_id.clone(),
                from,
                to,
            });
        }
        record.state = to;
        match to {
            TxnState::Committed => self.stats.committed += 1,
            TxnState::Aborted => self.stats.aborted += 1,
            TxnState::ForceAborted => self.stats.force_aborted += 1,
            TxnState::Deleted => self.stats.deleted += 1,
            TxnState::InProgress => {}
        }
        tracing::debug!(txn = %txn_id, %from, %to, "txn state transition");
        Ok(to)
    }

    /// Record a heartbeat. Returns the terminal state instead of updating
    /// when the transaction can no longer make progress.
    pub fn heartbeat(&mut self, txn_id: &TxnId, now: Instant) -> Option<Option<TxnState>> {
        let record = self.records.get_mut(txn_id)?;
        match record.state {
            TxnState::InProgress => {
                record.last_heartbeat = now;
                Some(None)
            }
            state => Some(Some(state)),
        }
    }

    /// True when the transaction's heartbeat is within the deadline.
    pub fn is_heartbeat_fresh(&self, txn_id: &TxnId, now: Instant) -> bool {
        self.records
            .get(txn_id)
            .map(|r| now.duration_since(r.last_heartbeat) < self.heartbeat_deadline)
            .unwrap_or(false)
    }

    /// InProgress transactions whose heartbeat has expired at `now`.
    pub fn expired(&self, now: Instant) -> Vec<TxnId> {
        self.records
            .values()
            .filter(|r| {
                r.state == TxnState::InProgress
                    && now.duration_since(r.last_heartbeat) > self.heartbeat_deadline
            })
            .map(|r| r.txn_id.clone())
            .collect()
    }

    pub fn record_write_key(&mut self, txn_id: &TxnId, key: Key) {
        if let Some(record) = self.records.get_mut(txn_id) {
            record.write_keys.insert(key);
        }
    }

    pub fn merge_write_keys(&mut self, txn_id: &TxnId, keys: impl IntoIterator<Item = Key>) {
        if let Some(record) = self.records.get_mut(txn_id) {
            record.write_keys.extend(keys);
        }
    }

    /// Drop a Deleted record from the table.
    pub fn remove(&mut self, txn_id: &TxnId) -> Option<TxnRecord> {
        self.records.remove(txn_id)
    }

    pub fn snapshot(&self) -> TxnStatsSnapshot {
        TxnStatsSnapshot {
            active_count: self
                .records
                .values()
                .filter(|r| r.state == TxnState::InProgress)
                .count(),
            ..self.stats
        }
    }
}
