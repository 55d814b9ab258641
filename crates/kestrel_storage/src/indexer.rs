use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use kestrel_common::types::{DataRecord, Key, RecordStatus, Timestamp, TxnId};

/// The version history of one key, newest first. At most one write intent may
/// be present and it is always at the front.
pub type Versions = VecDeque<DataRecord>;

/// Ordered multi-version index over all keys a partition owns.
///
/// Callers have verified the history invariants before inserting; lookups by
/// position (`first_at_or_after` etc.) replace held iterators, so a scan can
/// resume by key after any suspension.
#[derive(Debug, Default)]
pub struct Indexer {
    map: BTreeMap<Key, Versions>,
}

impl Indexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_count(&self) -> usize {
        self.map.len()
    }

    pub fn versions(&self, key: &Key) -> Option<&Versions> {
        self.map.get(key)
    }

    /// Newest version of the key regardless of status.
    pub fn latest(&self, key: &Key) -> Option<&DataRecord> {
        self.map.get(key).and_then(|v| v.front())
    }

    pub fn front_mut(&mut self, key: &Key) -> Option<&mut DataRecord> {
        self.map.get_mut(key).and_then(|v| v.front_mut())
    }

    /// Newest committed version of the key, skipping any write intent.
    pub fn latest_committed(&self, key: &Key) -> Option<&DataRecord> {
        self.map
            .get(key)?
            .iter()
            .find(|r| r.status == RecordStatus::Committed)
    }

    /// Newest version visible at `ts`: the first record whose timestamp is
    /// not newer than `ts`. May be a write intent (always the front); every
    /// deeper record is committed.
    pub fn visible_at<'a>(&'a self, key: &Key, ts: &Timestamp) -> Option<&'a DataRecord> {
        self.map
            .get(key)?
            .iter()
            .find(|r| r.timestamp().compare_certain(ts).is_le())
    }

    /// Push a new version at the front of the key's history.
    pub fn insert_version(&mut self, key: Key, record: DataRecord) {
        self.map.entry(key).or_default().push_front(record);
    }

    /// Remove the version with exactly this timestamp. Empty histories are
    /// dropped from the map.
    pub fn remove_version(&mut self, key: &Key, ts: &Timestamp) -> Option<DataRecord> {
        let versions = self.map.get_mut(key)?;
        let idx = versions
            .iter()
            .position(|r| r.timestamp().compare_certain(ts).is_eq())?;
        let removed = versions.remove(idx);
        if versions.is_empty() {
            self.map.remove(key);
        }
        removed
    }

    /// Pop the newest version. Empty histories are dropped from the map.
    pub fn pop_front(&mut self, key: &Key) -> Option<DataRecord> {
        let versions = self.map.get_mut(key)?;
        let rec = versions.pop_front();
        if versions.is_empty() {
            self.map.remove(key);
        }
        rec
    }

    /// Flip the front write intent of `txn_id` to committed, preserving its
    /// position. Returns false when the front is absent or not this
    /// transaction's intent.
    pub fn commit_front(&mut self, key: &Key, txn_id: &TxnId) -> bool {
        match self.front_mut(key) {
            Some(rec) if rec.is_write_intent() && rec.txn_id == *txn_id => {
                rec.status = RecordStatus::Committed;
                true
            }
            _ => false,
        }
    }

    pub fn first_at_or_after(&self, key: &Key) -> Option<(&Key, &Versions)> {
        self.map
            .range::<Key, _>((Bound::Included(key), Bound::Unbounded))
            .next()
    }

    pub fn first_after(&self, key: &Key) -> Option<(&Key, &Versions)> {
        self.map
            .range::<Key, _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
    }

    pub fn last_at_or_before(&self, key: &Key) -> Option<(&Key, &Versions)> {
        self.map
            .range::<Key, _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
    }

    pub fn last_before(&self, key: &Key) -> Option<(&Key, &Versions)> {
        self.map
            .range::<Key, _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
    }

    /// Drop every committed version strictly below `watermark` except the
    /// newest one still visible at it. Histories that become empty disappear.
    pub fn trim_below(&mut self, watermark: &Timestamp) -> usize {
        let mut trimmed = 0;
        let keys: Vec<Key> = self.map.keys().cloned().collect();
        for key in keys {
            if let Some(versions) = self.map.get_mut(&key) {
                if let Some(keep) = versions
                    .iter()
                    .position(|r| r.timestamp().compare_certain(watermark).is_lt())
                {
                    let len = versions.len();
                    versions.truncate(keep + 1);
                    trimmed += len - versions.len();
                }
            }
        }
        trimmed
    }

    /// Structural invariant check used by tests: committed timestamps
    /// strictly decrease; at most one write intent, only at the front.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (key, versions) in &self.map {
            if versions.is_empty() {
                return Err(format!("{key}: empty history retained"));
            }
            for (i, rec) in versions.iter().enumerate() {
                if rec.is_write_intent() && i != 0 {
                    return Err(format!("{key}: write intent below the front"));
                }
            }
            for pair in versions
                .iter()
                .filter(|r| r.status == RecordStatus::Committed)
                .collect::<Vec<_>>()
                .windows(2)
            {
                if pair[0].timestamp().compare_certain(&pair[1].timestamp()).is_le() {
                    return Err(format!("{key}: committed versions not strictly decreasing"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::schema::SerializedRow;
    use kestrel_common::types::{Mtr, Priority};

    fn rec(end: u64, status: RecordStatus) -> DataRecord {
        DataRecord {
            value: SerializedRow::default(),
            is_tombstone: false,
            schema_version: 1,
            txn_id: TxnId {
                trh_key: Key::new("s", "trh", ""),
                mtr: Mtr {
                    timestamp: Timestamp::new(end, 0, 1),
                    priority: Priority::MEDIUM,
                },
            },
            status,
        }
    }

    fn key(pk: &str) -> Key {
        Key::new("s", pk, "")
    }

    #[test]
    fn test_visible_at_picks_newest_not_newer() {
        let mut idx = Indexer::new();
        idx.insert_version(key("a"), rec(10, RecordStatus::Committed));
        idx.insert_version(key("a"), rec(20, RecordStatus::Committed));
        idx.insert_version(key("a"), rec(30, RecordStatus::Committed));

        let at = |end: u64| {
            idx.visible_at(&key("a"), &Timestamp::new(end, 0, 1))
                .map(|r| r.timestamp().end())
        };
        assert_eq!(at(5), None);
        assert_eq!(at(10), Some(10));
        assert_eq!(at(25), Some(20));
        assert_eq!(at(99), Some(30));
        idx.check_invariants().unwrap();
    }

    #[test]
    fn test_write_intent_blocks_only_when_visible() {
        let mut idx = Indexer::new();
        idx.insert_version(key("a"), rec(10, RecordStatus::Committed));
        idx.insert_version(key("a"), rec(50, RecordStatus::WriteIntent));

        let vis = idx.visible_at(&key("a"), &Timestamp::new(20, 0, 1)).unwrap();
        assert_eq!(vis.status, RecordStatus::Committed);

        let vis = idx.visible_at(&key("a"), &Timestamp::new(60, 0, 1)).unwrap();
        assert!(vis.is_write_intent());
    }

    #[test]
    fn test_pop_front_drops_empty_history() {
        let mut idx = Indexer::new();
        idx.insert_version(key("a"), rec(10, RecordStatus::WriteIntent));
        assert!(idx.pop_front(&key("a")).is_some());
        assert_eq!(idx.key_count(), 0);
        assert!(idx.pop_front(&key("a")).is_none());
    }

    #[test]
    fn test_remove_version_by_timestamp() {
        let mut idx = Indexer::new();
        idx.insert_version(key("a"), rec(10, RecordStatus::Committed));
        idx.insert_version(key("a"), rec(20, RecordStatus::Committed));
        let removed = idx.remove_version(&key("a"), &Timestamp::new(10, 0, 1));
        assert_eq!(removed.unwrap().timestamp().end(), 10);
        assert_eq!(idx.versions(&key("a")).unwrap().len(), 1);
    }

    #[test]
    fn test_commit_front_flips_only_own_intent() {
        let mut idx = Indexer::new();
        idx.insert_version(key("a"), rec(10, RecordStatus::WriteIntent));
        let other = rec(99, RecordStatus::WriteIntent).txn_id;
        assert!(!idx.commit_front(&key("a"), &other));
        let own = idx.latest(&key("a")).unwrap().txn_id.clone();
        assert!(idx.commit_front(&key("a"), &own));
        assert_eq!(
            idx.latest(&key("a")).unwrap().status,
            RecordStatus::Committed
        );
    }

    #[test]
    fn test_range_navigation() {
        let mut idx = Indexer::new();
        for pk in ["b", "d", "f"] {
            idx.insert_version(key(pk), rec(10, RecordStatus::Committed));
        }
        assert_eq!(idx.first_at_or_after(&key("b")).unwrap().0, &key("b"));
        assert_eq!(idx.first_after(&key("b")).unwrap().0, &key("d"));
        assert_eq!(idx.last_at_or_before(&key("d")).unwrap().0, &key("d"));
        assert_eq!(idx.last_before(&key("d")).unwrap().0, &key("b"));
        assert!(idx.first_after(&key("f")).is_none());
        assert!(idx.last_before(&key("b")).is_none());
    }

    #[test]
    fn test_trim_below_keeps_visible_version() {
        let mut idx = Indexer::new();
        idx.insert_version(key("a"), rec(10, RecordStatus::Committed));
        idx.insert_version(key("a"), rec(20, RecordStatus::Committed));
        idx.insert_version(key("a"), rec(30, RecordStatus::Committed));
        let trimmed = idx.trim_below(&Timestamp::new(25, 0, 1));
        assert_eq!(trimmed, 1);
        let versions = idx.versions(&key("a")).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions.back().unwrap().timestamp().end(), 20);
    }
}
