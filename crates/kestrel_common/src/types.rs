use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A TSO-issued timestamp with an uncertainty window.
///
/// `end` is the upper bound of the window in nanoseconds since the TSO's
/// epoch; `start() = end - start_delta` is the lower bound. Two timestamps
/// from the same TSO instance compare by `end`; timestamps from different
/// instances compare by their windows, falling back to the instance id when
/// the windows overlap. `compare_certain` is the only ordering the
/// transaction core uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    end: u64,
    start_delta: u32,
    tso_id: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        end: 0,
        start_delta: 0,
        tso_id: 0,
    };

    pub const MAX: Timestamp = Timestamp {
        end: u64::MAX,
        start_delta: 0,
        tso_id: u32::MAX,
    };

    pub fn new(end: u64, start_delta: u32, tso_id: u32) -> Self {
        Self {
            end,
            start_delta,
            tso_id,
        }
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Lower bound of the uncertainty window.
    #[inline]
    pub fn start(&self) -> u64 {
        self.end.saturating_sub(self.start_delta as u64)
    }

    #[inline]
    pub fn tso_id(&self) -> u32 {
        self.tso_id
    }

    /// Deterministic total order over timestamps.
    ///
    /// Same TSO instance: order by `end` (then `start_delta`, which only
    /// distinguishes otherwise-identical values). Different instances:
    /// disjoint windows order by position; overlapping windows order by
    /// instance id.
    pub fn compare_certain(&self, other: &Timestamp) -> Ordering {
        if self.tso_id == other.tso_id {
            return self
                .end
                .cmp(&other.end)
                .then(self.start_delta.cmp(&other.start_delta));
        }
        if self.end < other.start() {
            Ordering::Less
        } else if self.start() > other.end {
            Ordering::Greater
        } else {
            self.tso_id.cmp(&other.tso_id)
        }
    }

    /// The timestamp `dur` before this one, clamped at zero.
    /// Used to derive the retention boundary from a TSO "now".
    pub fn sub_duration(&self, dur: Duration) -> Timestamp {
        Timestamp {
            end: self.end.saturating_sub(dur.as_nanos() as u64),
            start_delta: 0,
            tso_id: self.tso_id,
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_certain(other)
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts:{}-{}@{}", self.start(), self.end, self.tso_id)
    }
}

/// Full key of a record: `(schema_name, partition_key, range_key)`.
///
/// Ordering is lexicographic over the triple, so all keys of one schema are
/// contiguous in the indexer. `partition_key` alone drives partition routing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Key {
    pub schema_name: String,
    pub partition_key: String,
    pub range_key: String,
}

impl Key {
    pub fn new(
        schema_name: impl Into<String>,
        partition_key: impl Into<String>,
        range_key: impl Into<String>,
    ) -> Self {
        Self {
            schema_name: schema_name.into(),
            partition_key: partition_key.into(),
            range_key: range_key.into(),
        }
    }

    /// Smallest key of the given schema.
    pub fn schema_range_start(schema_name: &str) -> Key {
        Key::new(schema_name, "", "")
    }

    /// A key strictly greater than every key of the given schema and smaller
    /// than any key of the lexicographically next schema name.
    pub fn schema_range_end(schema_name: &str) -> Key {
        Key::new(format!("{schema_name}\u{0}"), "", "")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.schema_name, self.partition_key, self.range_key
        )
    }
}

/// Transaction priority. Lower numeric value wins pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const HIGH: Priority = Priority(64);
    pub const MEDIUM: Priority = Priority(128);
    pub const LOW: Priority = Priority(192);
    pub const LOWEST: Priority = Priority(255);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prio:{}", self.0)
    }
}

/// Minimum transaction record: carried with every request of a transaction.
/// The timestamp is globally unique (TSO-issued); priority breaks push ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mtr {
    pub timestamp: Timestamp,
    pub priority: Priority,
}

impl fmt::Display for Mtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mtr:[{}, {}]", self.timestamp, self.priority)
    }
}

/// Full transaction identity: the MTR plus the key whose owning partition
/// holds the transaction record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId {
    pub trh_key: Key,
    pub mtr: Mtr,
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:[{} @{}]", self.mtr, self.trh_key)
    }
}

/// Lifecycle state of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    InProgress,
    ForceAborted,
    Committed,
    Aborted,
    Deleted,
}

impl TxnState {
    /// Terminal states cannot move anywhere except `Deleted`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxnState::Committed | TxnState::Aborted | TxnState::Deleted
        )
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnState::InProgress => "in-progress",
            TxnState::ForceAborted => "force-aborted",
            TxnState::Committed => "committed",
            TxnState::Aborted => "aborted",
            TxnState::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

/// Commit status of a single version in a key's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    WriteIntent,
    Committed,
    Aborted,
}

/// One version of a key. Histories are deques of these, newest first; at most
/// one `WriteIntent` may be present and it is always at the front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub value: crate::schema::SerializedRow,
    pub is_tombstone: bool,
    pub schema_version: u32,
    pub txn_id: TxnId,
    pub status: RecordStatus,
}

impl DataRecord {
    /// The version timestamp: the owning transaction's start timestamp.
    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.txn_id.mtr.timestamp
    }

    #[inline]
    pub fn is_write_intent(&self) -> bool {
        self.status == RecordStatus::WriteIntent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(end: u64, delta: u32, tso: u32) -> Timestamp {
        Timestamp::new(end, delta, tso)
    }

    #[test]
    fn test_same_tso_orders_by_end() {
        assert_eq!(ts(10, 0, 1).compare_certain(&ts(20, 0, 1)), Ordering::Less);
        assert_eq!(
            ts(20, 0, 1).compare_certain(&ts(10, 0, 1)),
            Ordering::Greater
        );
        assert_eq!(ts(10, 0, 1).compare_certain(&ts(10, 0, 1)), Ordering::Equal);
    }

    #[test]
    fn test_disjoint_windows_order_by_position() {
        // [5,10]@1 vs [20,30]@2
        let a = ts(10, 5, 1);
        let b = ts(30, 10, 2);
        assert_eq!(a.compare_certain(&b), Ordering::Less);
        assert_eq!(b.compare_certain(&a), Ordering::Greater);
    }

    #[test]
    fn test_overlapping_windows_order_by_tso_id() {
        // [5,15]@1 vs [10,20]@2 overlap
        let a = ts(15, 10, 1);
        let b = ts(20, 10, 2);
        assert_eq!(a.compare_certain(&b), Ordering::Less);
        assert_eq!(b.compare_certain(&a), Ordering::Greater);
    }

    #[test]
    fn test_sub_duration_saturates() {
        let t = ts(1_000, 0, 1).sub_duration(Duration::from_nanos(400));
        assert_eq!(t.end(), 600);
        let t = ts(100, 0, 1).sub_duration(Duration::from_secs(1));
        assert_eq!(t.end(), 0);
    }

    #[test]
    fn test_key_order_groups_schemas() {
        let a = Key::new("customer", "w1", "c9");
        let b = Key::new("customer", "w2", "c1");
        let c = Key::new("district", "w1", "d1");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_schema_range_end_bounds_all_keys() {
        let hi = Key::schema_range_end("customer");
        assert!(Key::new("customer", "\u{10FFFF}", "\u{10FFFF}") < hi);
        assert!(hi < Key::schema_range_start("district"));
    }

    #[test]
    fn test_priority_lower_value_is_higher() {
        assert!(Priority::HIGH < Priority::LOW);
        assert!(Priority::HIGHEST < Priority::HIGH);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TxnState::InProgress.is_terminal());
        assert!(!TxnState::ForceAborted.is_terminal());
        assert!(TxnState::Committed.is_terminal());
        assert!(TxnState::Aborted.is_terminal());
        assert!(TxnState::Deleted.is_terminal());
    }
}
