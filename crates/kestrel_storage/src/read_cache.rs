use std::collections::BTreeMap;
use std::ops::Bound;

use kestrel_common::types::{Key, Timestamp};

#[derive(Debug, Clone)]
struct CachedInterval {
    end: Key,
    ts: Timestamp,
}

/// Bounded interval cache answering "what is the latest read that touched
/// this key range?".
///
/// Stored intervals are disjoint and keyed by their start; observing a range
/// merges every overlapping interval into its hull with the max timestamp.
/// The merge over-approximates (a key inside the hull may report a read it
/// never had), which is the allowed direction: the cache may report too high,
/// never too low.
///
/// When the bound is hit, the interval with the oldest timestamp is evicted
/// and the `min_tracked` watermark rises to it; every lookup is floored at
/// the watermark, so writes below it are rejected as potentially unsafe.
#[derive(Debug)]
pub struct ReadCache {
    intervals: BTreeMap<Key, CachedInterval>,
    capacity: usize,
    min_tracked: Timestamp,
}

impl ReadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            intervals: BTreeMap::new(),
            capacity: capacity.max(1),
            min_tracked: Timestamp::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// The eviction watermark: no read below it is tracked individually.
    pub fn min_tracked(&self) -> Timestamp {
        self.min_tracked
    }

    /// Record that every key in `[lo, hi]` was read at some time `<= ts`.
    pub fn observe(&mut self, lo: Key, hi: Key, ts: Timestamp) {
        debug_assert!(lo <= hi, "interval bounds out of order");
        let mut new_lo = lo.clone();
        let mut new_hi = hi.clone();
        let mut new_ts = ts;

        // Overlapping intervals form a contiguous run at the tail of
        // range(..=hi) because stored intervals are disjoint and sorted.
        let mut absorbed: Vec<Key> = Vec::new();
        for (start, iv) in self
            .intervals
            .range::<Key, _>((Bound::Unbounded, Bound::Included(&hi)))
            .rev()
        {
            if iv.end < lo {
                break;
            }
            if *start < new_lo {
                new_lo = start.clone();
            }
            if iv.end > new_hi {
                new_hi = iv.end.clone();
            }
            if iv.ts.compare_certain(&new_ts).is_gt() {
                new_ts = iv.ts;
            }
            absorbed.push(start.clone());
        }
        for start in absorbed {
            self.intervals.remove(&start);
        }

        self.intervals.insert(
            new_lo,
            CachedInterval {
                end: new_hi,
                ts: new_ts,
            },
        );

        while self.intervals.len() > self.capacity {
            self.evict_oldest();
        }
    }

    /// Max read timestamp overlapping `[lo, hi]`, floored at the watermark.
    pub fn check_interval(&self, lo: &Key, hi: &Key) -> Timestamp {
        let mut max = self.min_tracked;
        for (_, iv) in self
            .intervals
            .range::<Key, _>((Bound::Unbounded, Bound::Included(hi)))
            .rev()
        {
            if iv.end < *lo {
                break;
            }
            if iv.ts.compare_certain(&max).is_gt() {
                max = iv.ts;
            }
        }
        max
    }

    /// Max read timestamp for a single key.
    pub fn check_key(&self, key: &Key) -> Timestamp {
        self.check_interval(key, key)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .intervals
            .iter()
            .min_by(|a, b| a.1.ts.compare_certain(&b.1.ts))
            .map(|(k, iv)| (k.clone(), iv.ts));
        if let Some((start, ts)) = oldest {
            self.intervals.remove(&start);
            if ts.compare_certain(&self.min_tracked).is_gt() {
                self.min_tracked = ts;
            }
            tracing::trace!(watermark = %self.min_tracked, "read cache evicted oldest interval");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(pk: &str) -> Key {
        Key::new("s", pk, "")
    }

    fn ts(end: u64) -> Timestamp {
        Timestamp::new(end, 0, 1)
    }

    #[test]
    fn test_point_observe_and_check() {
        let mut rc = ReadCache::new(16);
        rc.observe(k("b"), k("b"), ts(20));
        assert_eq!(rc.check_key(&k("b")), ts(20));
        assert_eq!(rc.check_key(&k("a")), Timestamp::ZERO);
        assert_eq!(rc.check_key(&k("c")), Timestamp::ZERO);
    }

    #[test]
    fn test_range_observe_covers_interior_keys() {
        let mut rc = ReadCache::new(16);
        rc.observe(k("p"), k("t"), ts(50));
        assert_eq!(rc.check_key(&k("r")), ts(50));
        assert_eq!(rc.check_key(&k("p")), ts(50));
        assert_eq!(rc.check_key(&k("t")), ts(50));
        assert_eq!(rc.check_key(&k("u")), Timestamp::ZERO);
    }

    #[test]
    fn test_overlapping_observes_merge_with_max_ts() {
        let mut rc = ReadCache::new(16);
        rc.observe(k("a"), k("f"), ts(10));
        rc.observe(k("d"), k("m"), ts(30));
        assert_eq!(rc.len(), 1);
        // Hull over-approximates: keys from the older interval now report the
        // newer timestamp. Too high is the allowed direction.
        assert_eq!(rc.check_key(&k("b")), ts(30));
        assert_eq!(rc.check_key(&k("m")), ts(30));
    }

    #[test]
    fn test_disjoint_intervals_stay_separate() {
        let mut rc = ReadCache::new(16);
        rc.observe(k("a"), k("b"), ts(10));
        rc.observe(k("x"), k("y"), ts(30));
        assert_eq!(rc.len(), 2);
        assert_eq!(rc.check_key(&k("a")), ts(10));
        assert_eq!(rc.check_key(&k("x")), ts(30));
        assert_eq!(rc.check_interval(&k("a"), &k("z")), ts(30));
    }

    #[test]
    fn test_eviction_raises_watermark() {
        let mut rc = ReadCache::new(2);
        rc.observe(k("a"), k("a"), ts(10));
        rc.observe(k("m"), k("m"), ts(20));
        rc.observe(k("z"), k("z"), ts(30));
        assert_eq!(rc.len(), 2);
        // The ts(10) interval was evicted; its key now reports the watermark.
        assert_eq!(rc.min_tracked(), ts(10));
        assert_eq!(rc.check_key(&k("a")), ts(10));
        assert_eq!(rc.check_key(&k("m")), ts(20));
    }

    #[test]
    fn test_check_floors_at_watermark_everywhere() {
        let mut rc = ReadCache::new(1);
        rc.observe(k("a"), k("a"), ts(10));
        rc.observe(k("b"), k("b"), ts(20));
        assert_eq!(rc.min_tracked(), ts(10));
        // A key never observed still reports at least the watermark.
        assert_eq!(rc.check_key(&k("zzz")), ts(10));
    }

    #[test]
    fn test_observe_lower_ts_does_not_regress() {
        let mut rc = ReadCache::new(16);
        rc.observe(k("a"), k("c"), ts(50));
        rc.observe(k("b"), k("b"), ts(10));
        assert_eq!(rc.check_key(&k("b")), ts(50));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn arb_key() -> impl Strategy<Value = Key> {
            "[a-f]{1,3}".prop_map(|pk| Key::new("s", pk, ""))
        }

        proptest! {
            /// Per-key max read timestamp never decreases over any sequence
            /// of observes.
            #[test]
            fn prop_check_key_is_monotonic(
                ops in proptest::collection::vec((arb_key(), arb_key(), 1u64..1000), 1..60),
                probe in arb_key(),
            ) {
                let mut rc = ReadCache::new(8);
                let mut last = Timestamp::ZERO;
                for (a, b, end) in ops {
                    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                    rc.observe(lo, hi, Timestamp::new(end, 0, 1));
                    let now = rc.check_key(&probe);
                    prop_assert!(now.compare_certain(&last).is_ge());
                    last = now;
                }
            }

            /// After observing [lo, hi] at ts, every key inside reports at
            /// least ts (the cache never under-reports).
            #[test]
            fn prop_never_under_reports(
                ops in proptest::collection::vec((arb_key(), arb_key(), 1u64..1000), 1..40),
            ) {
                let mut rc = ReadCache::new(1024);
                let mut observed: Vec<(Key, Key, Timestamp)> = Vec::new();
                for (a, b, end) in ops {
                    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                    let ts = Timestamp::new(end, 0, 1);
                    rc.observe(lo.clone(), hi.clone(), ts);
                    observed.push((lo, hi, ts));
                }
                for (lo, hi, ts) in &observed {
                    prop_assert!(rc.check_interval(lo, hi).compare_certain(ts).is_ge());
                }
            }
        }
    }
}
