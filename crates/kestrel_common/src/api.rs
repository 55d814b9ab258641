use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::collection::Pvid;
use crate::schema::{FieldValue, Schema, SerializedRow};
use crate::types::{DataRecord, Key, Mtr, Timestamp, TxnId, TxnState};

/// Absolute deadline carried by every request. Handlers surface
/// `RequestTimeout` on expiry and never leave partially applied state.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(dur: Duration) -> Self {
        Self {
            expires_at: Instant::now() + dur,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_over(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Commit or abort, as requested by the client at transaction end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndAction {
    Commit,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    pub collection: String,
    pub pvid: Pvid,
    pub key: Key,
    pub mtr: Mtr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    pub value: SerializedRow,
    pub schema_version: u32,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub collection: String,
    pub pvid: Pvid,
    pub key: Key,
    pub mtr: Mtr,
    /// Key whose partition holds this transaction's record.
    pub trh_key: Key,
    /// True on the transaction's first write: the receiving partition creates
    /// the transaction record.
    pub designate_trh: bool,
    pub schema_version: u32,
    pub value: SerializedRow,
    pub is_delete: bool,
    pub reject_if_exists: bool,
    /// When set, unset fields are filled from the latest committed version
    /// (translated across schema versions by field name and type).
    pub fields_for_partial_update: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteResponse {}

/// Comparison operator of a scan predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// A single field predicate; a query's filter is the conjunction of its
/// predicates. Rows lacking the named field (under their own schema version)
/// are excluded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldPredicate {
    pub field: String,
    pub op: PredicateOp,
    pub value: FieldValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub collection: String,
    pub pvid: Pvid,
    /// Scan origin; for reverse scans this is the upper edge.
    pub start: Key,
    /// Scan terminus; an empty partition key means the schema's edge.
    pub end: Key,
    pub mtr: Mtr,
    pub reverse: bool,
    /// Skip `start` itself (used when resuming from a continuation token).
    pub exclusive_start: bool,
    pub filter: Vec<FieldPredicate>,
    /// Field names to project; empty means full rows.
    pub projection: Vec<String>,
    /// Max rows in this response page; the partition also enforces its own
    /// byte cap.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub rows: Vec<SerializedRow>,
    /// Where the next page starts; None when the scan is complete. The key
    /// may belong to a neighboring partition.
    pub next_to_scan: Option<Key>,
    /// Whether the continuation key itself has already been covered (set for
    /// reverse scans resuming below a partition boundary).
    pub exclusive_token: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnPushRequest {
    pub collection: String,
    pub pvid: Pvid,
    /// The incumbent's TRH key; routes this request to its TR partition.
    pub key: Key,
    pub incumbent_txn_id: TxnId,
    pub challenger_mtr: Mtr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnPushResponse {
    pub incumbent_state: TxnState,
    /// True when the challenger may proceed (the incumbent was or is aborted).
    pub challenger_proceeds: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnEndRequest {
    pub collection: String,
    pub pvid: Pvid,
    pub txn_id: TxnId,
    pub action: EndAction,
    /// The transaction's full write set, reported by the client.
    pub write_keys: Vec<Key>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxnEndResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnHeartbeatRequest {
    pub collection: String,
    pub pvid: Pvid,
    pub txn_id: TxnId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxnHeartbeatResponse {
    /// Set when the transaction reached a terminal state; the client stops
    /// heartbeating.
    pub terminal_state: Option<TxnState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnFinalizeRequest {
    pub collection: String,
    pub pvid: Pvid,
    /// The key whose write intent is being finalized.
    pub key: Key,
    pub txn_id: TxnId,
    pub action: EndAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxnFinalizeResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSchemaRequest {
    pub collection: String,
    pub schema: Schema,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushSchemaResponse {}

/// A read result paired with its key, as returned by scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyedRecord {
    pub key: Key,
    pub record: DataRecord,
}
