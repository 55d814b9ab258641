use kestrel_common::api::{Deadline, FieldPredicate, PredicateOp, QueryRequest, QueryResponse};
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::schema::SerializedRow;
use kestrel_common::types::{DataRecord, Key, TxnId};

use crate::module::PartitionModule;

enum ScanStep {
    /// Page finished; the token is where the next page starts (None = done)
    /// plus whether that key itself is already covered.
    Done(Option<(Key, bool)>),
    /// A foreign write intent blocks the scan at `key`.
    Blocked { key: Key, incumbent: TxnId },
}

impl PartitionModule {
    /// Serve a range scan page. The scanned range is recorded in the read
    /// cache before returning — including empty results — so later writes
    /// into the range are rejected as phantoms.
    pub async fn handle_query(
        &self,
        req: QueryRequest,
        deadline: Deadline,
    ) -> KestrelResult<QueryResponse> {
        if req.collection != self.collection_name() || req.pvid != self.descriptor().pvid {
            return Err(KestrelError::RefreshCollection(req.collection));
        }
        // An empty partition key addresses the schema's edge; anything else
        // must be ours.
        if !req.start.partition_key.is_empty() && !self.descriptor().owns(&req.start) {
            return Err(KestrelError::RefreshCollection(req.collection));
        }
        self.validate_retention(&req.mtr)?;
        let schema_name = req.start.schema_name.clone();
        if !self.schema_known(&schema_name) {
            return Err(KestrelError::SchemaNotFound {
                name: schema_name,
                version: 0,
            });
        }

        // Effective bounds: the terminus is excluded; empty partition keys
        // widen to the schema's edges.
        let start_key = if req.start.partition_key.is_empty() {
            if req.reverse {
                Key::schema_range_end(&schema_name)
            } else {
                Key::schema_range_start(&schema_name)
            }
        } else {
            req.start.clone()
        };
        let end_bound = if req.end.partition_key.is_empty() {
            if req.reverse {
                Key::schema_range_start(&schema_name)
            } else {
                Key::schema_range_end(&schema_name)
            }
        } else {
            req.end.clone()
        };

        // A degenerate range reads nothing and claims nothing.
        let degenerate = if req.reverse {
            start_key <= end_bound
        } else {
            start_key >= end_bound
        };
        if degenerate {
            return Ok(QueryResponse {
                rows: Vec::new(),
                next_to_scan: None,
                exclusive_token: false,
            });
        }

        let row_limit = req
            .limit
            .unwrap_or(usize::MAX)
            .min(self.config.query_page_row_limit);

        let mut rows: Vec<SerializedRow> = Vec::new();
        let mut bytes = 0usize;
        let mut cursor = start_key.clone();
        let mut exclusive = req.exclusive_start;
        let mut push_budget = self.config.push_retries;

        let token = loop {
            self.check_deadline(&deadline)?;

            // One pass under the lock. The pass's scanned segment is recorded
            // in the read cache before the lock drops, so a write can never
            // slip under a range this page has already claimed to have read.
            let step = {
                let mut state = self.lock_state();
                let pass_start = cursor.clone();
                let step = loop {
                    let entry = match (req.reverse, exclusive) {
                        (false, false) => state.indexer.first_at_or_after(&cursor),
                        (false, true) => state.indexer.first_after(&cursor),
                        (true, false) => state.indexer.last_at_or_before(&cursor),
                        (true, true) => state.indexer.last_before(&cursor),
                    };
                    let (key, versions) = match entry {
                        // Our slice of the schema is exhausted; the scan may
                        // continue at the neighboring partition.
                        None => {
                            break ScanStep::Done(self.partition_edge_token(
                                req.reverse,
                                &schema_name,
                                &end_bound,
                            ))
                        }
                        Some(kv) => kv,
                    };
                    if key.schema_name != schema_name {
                        break ScanStep::Done(self.partition_edge_token(
                            req.reverse,
                            &schema_name,
                            &end_bound,
                        ));
                    }
                    let past_bound = if req.reverse {
                        *key <= end_bound
                    } else {
                        *key >= end_bound
                    };
                    if past_bound {
                        break ScanStep::Done(None);
                    }
                    if !self.descriptor().owns(key) {
                        break ScanStep::Done(Some((key.clone(), false)));
                    }
                    if rows.len() >= row_limit || bytes >= self.config.query_page_byte_limit {
                        break ScanStep::Done(Some((key.clone(), false)));
                    }

                    let visible = versions
                        .iter()
                        .find(|r| r.timestamp().compare_certain(&req.mtr.timestamp).is_le());
                    match visible {
                        Some(rec) if rec.is_write_intent() && rec.txn_id.mtr != req.mtr => {
                            break ScanStep::Blocked {
                                key: key.clone(),
                                incumbent: rec.txn_id.clone(),
                            };
                        }
                        Some(rec) if !rec.is_tombstone => {
                            if self.row_matches(&schema_name, &req.filter, rec)? {
                                let row = self.project_row(&schema_name, &req.projection, rec)?;
                                bytes += row.estimate_bytes();
                                rows.push(row);
                            }
                        }
                        _ => {}
                    }
                    cursor = key.clone();
                    exclusive = true;
                };

                let stop = match &step {
                    ScanStep::Done(Some((k, _))) => k.clone(),
                    ScanStep::Done(None) => end_bound.clone(),
                    ScanStep::Blocked { key, .. } => key.clone(),
                };
                let (lo, hi) = if req.reverse {
                    (stop, pass_start)
                } else {
                    (pass_start, stop)
                };
                state.read_cache.observe(lo, hi, req.mtr.timestamp);
                step
            };

            match step {
                ScanStep::Done(token) => break token,
                ScanStep::Blocked { key, incumbent } => {
                    if push_budget == 0 {
                        return Err(KestrelError::AbortConflict(incumbent));
                    }
                    push_budget -= 1;
                    if !self
                        .do_push(&req.collection, &key, incumbent.clone(), req.mtr, deadline)
                        .await?
                    {
                        return Err(KestrelError::AbortConflict(incumbent));
                    }
                    // The intent is gone; re-examine the same key.
                    cursor = key;
                    exclusive = false;
                }
            }
        };

        let (next_to_scan, exclusive_token) = match token {
            Some((key, exclusive)) => (Some(key), exclusive),
            None => (None, false),
        };
        Ok(QueryResponse {
            rows,
            next_to_scan,
            exclusive_token,
        })
    }

    /// When this partition's slice of the range is exhausted but the request
    /// extends past its boundary, the scan continues at the neighbor. Hash
    /// collections have no meaningful cross-partition key order, so their
    /// scans stay within one partition.
    fn partition_edge_token(
        &self,
        reverse: bool,
        schema_name: &str,
        end_bound: &Key,
    ) -> Option<(Key, bool)> {
        let kestrel_common::collection::OwnershipRange::Range { start, end } =
            &self.partition.range
        else {
            return None;
        };
        if reverse {
            if start.is_empty() {
                return None;
            }
            let edge = Key::new(schema_name, start.clone(), "");
            // Everything below the boundary belongs to the predecessor; the
            // boundary key itself was covered here.
            (*end_bound < edge).then_some((edge, true))
        } else {
            if end.is_empty() {
                return None;
            }
            let edge = Key::new(schema_name, end.clone(), "");
            (edge < *end_bound).then_some((edge, false))
        }
    }

    fn row_matches(
        &self,
        schema_name: &str,
        filter: &[FieldPredicate],
        rec: &DataRecord,
    ) -> KestrelResult<bool> {
        if filter.is_empty() {
            return Ok(true);
        }
        let schema = self.schema(schema_name, rec.schema_version)?;
        for pred in filter {
            let Some(idx) = schema.find_field(&pred.field, pred.value.field_type()) else {
                return Ok(false);
            };
            let Some(actual) = rec.value.get(idx) else {
                return Ok(false);
            };
            let Some(ord) = actual.compare(&pred.value) else {
                return Ok(false);
            };
            let pass = match pred.op {
                PredicateOp::Eq => ord.is_eq(),
                PredicateOp::Ne => ord.is_ne(),
                PredicateOp::Lt => ord.is_lt(),
                PredicateOp::Lte => ord.is_le(),
                PredicateOp::Gt => ord.is_gt(),
                PredicateOp::Gte => ord.is_ge(),
            };
            if !pass {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Project a row onto the requested field names; absent fields project
    /// as unset.
    fn project_row(
        &self,
        schema_name: &str,
        projection: &[String],
        rec: &DataRecord,
    ) -> KestrelResult<SerializedRow> {
        if projection.is_empty() {
            return Ok(rec.value.clone());
        }
        let schema = self.schema(schema_name, rec.schema_version)?;
        Ok(SerializedRow::new(
            projection
                .iter()
                .map(|name| schema.field_index(name).and_then(|i| rec.value.get(i).cloned()))
                .collect(),
        ))
    }
}
