use kestrel_common::api::{Deadline, WriteRequest, WriteResponse};
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::schema::{FieldValue, Schema, SerializedRow};
use kestrel_common::types::{DataRecord, RecordStatus, TxnId, TxnState};
use kestrel_storage::plog::PlogEntry;

use crate::module::{PartitionModule, PartitionState};

enum PreparedWrite {
    /// A foreign write intent blocks this write; push its owner.
    Conflict(TxnId),
    /// The intent is in the indexer; these entries make it durable.
    Staged(Vec<PlogEntry>),
}

impl PartitionModule {
    /// Serve a write: stale-write and read-barrier checks, write-intent
    /// conflict arbitration, partial-update assembly, then durable intent
    /// creation.
    pub async fn handle_write(
        &self,
        req: WriteRequest,
        deadline: Deadline,
    ) -> KestrelResult<WriteResponse> {
        self.validate_partition(&req.collection, &req.pvid, &req.key)?;
        if req.key.partition_key.is_empty() {
            return Err(KestrelError::BadParameter(
                "missing partition key in write request".into(),
            ));
        }
        self.validate_retention(&req.mtr)?;
        let schema = self.schema(&req.key.schema_name, req.schema_version)?;
        if req.designate_trh && !self.partition.owns(&req.trh_key) {
            return Err(KestrelError::BadParameter(
                "TRH designation must arrive at the partition owning the TRH key".into(),
            ));
        }
        let txn_id = TxnId {
            trh_key: req.trh_key.clone(),
            mtr: req.mtr,
        };

        let mut push_budget = self.config.push_retries;
        loop {
            self.check_deadline(&deadline)?;

            // All checks and the indexer insert happen in one critical
            // section; durability follows, and the intent is withdrawn if
            // the append fails.
            let prepared = {
                let mut state = self.lock_state();
                self.prepare_write(&mut state, &req, &schema, &txn_id)?
            };
            let to_persist = match prepared {
                PreparedWrite::Conflict(incumbent) => {
                    if push_budget == 0 {
                        return Err(KestrelError::AbortConflict(incumbent));
                    }
                    push_budget -= 1;
                    if !self
                        .do_push(&req.collection, &req.key, incumbent.clone(), req.mtr, deadline)
                        .await?
                    {
                        return Err(KestrelError::AbortConflict(incumbent));
                    }
                    continue;
                }
                PreparedWrite::Staged(entries) => entries,
            };

            let mut persist_result = Ok(());
            for entry in to_persist {
                if let Err(e) = self.plog.append(entry).await {
                    persist_result = Err(e);
                    break;
                }
            }
            if persist_result.is_ok() {
                persist_result = self.plog.flush().await;
            }
            if let Err(e) = persist_result {
                let mut state = self.lock_state();
                let ours = matches!(
                    state.indexer.latest(&req.key),
                    Some(r) if r.is_write_intent() && r.txn_id == txn_id
                );
                if ours {
                    state.indexer.pop_front(&req.key);
                }
                e.log_if_fatal();
                return Err(e);
            }
            return Ok(WriteResponse::default());
        }
    }

    fn prepare_write(
        &self,
        state: &mut PartitionState,
        req: &WriteRequest,
        schema: &Schema,
        txn_id: &TxnId,
    ) -> KestrelResult<PreparedWrite> {
        // A foreign write intent at the front means a write-write race; the
        // push protocol decides who survives.
        if let Some(front) = state.indexer.latest(&req.key) {
            if front.is_write_intent() && front.txn_id != *txn_id {
                return Ok(PreparedWrite::Conflict(front.txn_id.clone()));
            }
        }

        // Read-before-write barrier. Timestamps are TSO-unique, so an equal
        // read timestamp can only be this transaction's own read and does
        // not block the write.
        let max_read = state.read_cache.check_key(&req.key);
        if max_read.compare_certain(&req.mtr.timestamp).is_gt() {
            return Err(KestrelError::AbortRequestTooOld(format!(
                "key {} was read at {max_read}, write at {}",
                req.key, req.mtr.timestamp
            )));
        }
        // Below the eviction watermark nothing is attributable: reads at or
        // above the write timestamp may have been evicted, so reject.
        let watermark = state.read_cache.min_tracked();
        if watermark.compare_certain(&req.mtr.timestamp).is_ge() {
            return Err(KestrelError::AbortRequestTooOld(format!(
                "write at {} is not above the read-cache watermark {watermark}",
                req.mtr.timestamp
            )));
        }

        // Committed history must stay strictly decreasing.
        if let Some(committed) = state.indexer.latest_committed(&req.key) {
            if committed
                .timestamp()
                .compare_certain(&req.mtr.timestamp)
                .is_ge()
            {
                return Err(KestrelError::AbortRequestTooOld(format!(
                    "key {} has a committed version at {}",
                    req.key,
                    committed.timestamp()
                )));
            }
        }

        // Insert semantics: a live value visible at the write timestamp
        // (committed, or this transaction's own earlier write) conflicts.
        if req.reject_if_exists {
            if let Some(existing) = state.indexer.visible_at(&req.key, &req.mtr.timestamp) {
                if !existing.is_tombstone {
                    return Err(KestrelError::AbortConflict(existing.txn_id.clone()));
                }
            }
        }

        let value = match &req.fields_for_partial_update {
            Some(updated) => self.assemble_partial_update(state, req, schema, updated)?,
            None => {
                let mut fields = req.value.fields.clone();
                fields.resize(schema.fields.len(), None);
                SerializedRow::new(fields)
            }
        };

        let mut entries = Vec::with_capacity(2);

        // Transaction-record bookkeeping at the TRH.
        if req.designate_trh {
            let created_now = state.txns.get(txn_id).is_none();
            state.txns.create(txn_id.clone(), std::time::Instant::now())?;
            if created_now {
                entries.push(PlogEntry::TxnStateChange {
                    txn_id: txn_id.clone(),
                    state: TxnState::InProgress,
                });
            }
        }
        if let Some(record) = state.txns.get(txn_id) {
            if record.state != TxnState::InProgress {
                return Err(KestrelError::AbortConflict(txn_id.clone()));
            }
        }
        state.txns.record_write_key(txn_id, req.key.clone());

        // Re-writing our own key replaces the earlier intent.
        let own_front = matches!(
            state.indexer.latest(&req.key),
            Some(r) if r.is_write_intent() && r.txn_id == *txn_id
        );
        if own_front {
            state.indexer.pop_front(&req.key);
        }

        let record = DataRecord {
            value,
            is_tombstone: req.is_delete,
            schema_version: req.schema_version,
            txn_id: txn_id.clone(),
            status: RecordStatus::WriteIntent,
        };
        entries.push(PlogEntry::WriteIntent {
            key: req.key.clone(),
            txn_id: txn_id.clone(),
            schema_version: record.schema_version,
            value: record.value.clone(),
            is_tombstone: record.is_tombstone,
        });
        state.indexer.insert_version(req.key.clone(), record);
        Ok(PreparedWrite::Staged(entries))
    }

    /// Expand a partial update into a full row: explicitly updated fields
    /// come from the request, everything else from the newest visible
    /// version, translated across schema versions by field name and type.
    fn assemble_partial_update(
        &self,
        state: &PartitionState,
        req: &WriteRequest,
        schema: &Schema,
        updated: &[u32],
    ) -> KestrelResult<SerializedRow> {
        let base = state
            .indexer
            .visible_at(&req.key, &req.mtr.timestamp)
            .filter(|r| !r.is_tombstone)
            .ok_or_else(|| {
                KestrelError::BadParameter(format!(
                    "partial update of {} has no previous version",
                    req.key
                ))
            })?;

        let mut fields: Vec<Option<FieldValue>> = req.value.fields.clone();
        fields.resize(schema.fields.len(), None);

        if base.schema_version == req.schema_version {
            for (idx, slot) in fields.iter_mut().enumerate() {
                if slot.is_none() && !updated.contains(&(idx as u32)) {
                    *slot = base.value.get(idx).cloned();
                }
            }
        } else {
            let base_schema = self.schema(&req.key.schema_name, base.schema_version)?;
            for (idx, slot) in fields.iter_mut().enumerate() {
                if slot.is_none() && !updated.contains(&(idx as u32)) {
                    let def = &schema.fields[idx];
                    if let Some(base_idx) = base_schema.find_field(&def.name, def.field_type) {
                        *slot = base.value.get(base_idx).cloned();
                    }
                }
            }
        }

        let row = SerializedRow::new(fields);
        if schema.partition_key_of(&row).is_none() || schema.range_key_of(&row).is_none() {
            return Err(KestrelError::BadParameter(format!(
                "partial update of {} leaves a key field unset",
                req.key
            )));
        }
        Ok(row)
    }
}
