use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kestrel_common::error::KestrelResult;
use kestrel_common::transport::TimestampSource;
use kestrel_common::types::Timestamp;

/// A batch of timestamps issued by the TSO. The batch describes a strictly
/// increasing arithmetic sequence `base + i * step` for `i < count`, valid
/// for `ttl` from receipt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimestampBatch {
    /// End-time base of the first timestamp, in nanoseconds.
    pub base: u64,
    pub tso_id: u32,
    /// Uncertainty window width applied to every timestamp.
    pub start_delta: u32,
    pub ttl: Duration,
    pub count: u32,
    /// Nanoseconds between consecutive timestamps.
    pub step: u32,
}

impl TimestampBatch {
    pub fn timestamp(&self, idx: u32) -> Timestamp {
        debug_assert!(idx < self.count);
        Timestamp::new(
            self.base + idx as u64 * self.step as u64,
            self.start_delta,
            self.tso_id,
        )
    }
}

#[derive(Debug, Clone)]
pub struct TsoConfig {
    /// Uncertainty window width in nanoseconds.
    pub start_delta: u32,
    /// How long an issued batch stays valid at the client.
    pub batch_ttl: Duration,
    /// Nanoseconds between consecutive timestamps in a batch.
    pub step: u32,
}

impl Default for TsoConfig {
    fn default() -> Self {
        Self {
            start_delta: 2_000,
            batch_ttl: Duration::from_millis(100),
            step: 10,
        }
    }
}

#[derive(Debug, Default)]
struct WorkerState {
    /// Microsecond tick the last batch was issued against.
    last_tick_us: u64,
    issued_in_tick: u32,
}

/// In-process timestamp oracle worker.
///
/// Issues batches against a microsecond tick of the wall clock. Each tick
/// can carry `1000 / step` timestamps; when a tick is exhausted (or the
/// clock reads backwards) issuance advances to the next logical tick, so the
/// sequence is strictly increasing regardless of clock behavior.
pub struct TsoService {
    tso_id: u32,
    config: TsoConfig,
    state: Mutex<WorkerState>,
}

impl TsoService {
    pub fn new(tso_id: u32) -> Self {
        Self::with_config(tso_id, TsoConfig::default())
    }

    pub fn with_config(tso_id: u32, config: TsoConfig) -> Self {
        Self {
            tso_id,
            config,
            state: Mutex::new(WorkerState::default()),
        }
    }

    pub fn tso_id(&self) -> u32 {
        self.tso_id
    }

    fn wall_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    /// Issue a batch of at most `requested` timestamps (at least one).
    pub fn issue_batch(&self, requested: u32) -> TimestampBatch {
        let requested = requested.max(1);
        let per_tick = (1_000 / self.config.step).max(1);
        let mut state = self.state.lock();

        let now_us = Self::wall_micros();
        let (tick, first_slot) = if now_us > state.last_tick_us {
            // Fresh tick: the common fast path.
            (now_us, 0)
        } else if state.issued_in_tick < per_tick {
            // Same tick with leftover slots.
            (state.last_tick_us, state.issued_in_tick)
        } else {
            // Tick exhausted (or clock regressed): advance logically.
            (state.last_tick_us + 1, 0)
        };

        let count = requested.min(per_tick - first_slot);
        state.last_tick_us = tick;
        state.issued_in_tick = first_slot + count;

        TimestampBatch {
            base: tick * 1_000 + first_slot as u64 * self.config.step as u64,
            tso_id: self.tso_id,
            start_delta: self.config.start_delta,
            ttl: self.config.batch_ttl,
            count,
            step: self.config.step,
        }
    }
}

struct CachedBatch {
    batch: TimestampBatch,
    next_idx: u32,
    fetched_at: Instant,
}

/// Client-side batch cache over a TSO service. Hands out strictly
/// increasing timestamps; a batch is used only within its TTL.
pub struct TsoClient {
    service: std::sync::Arc<TsoService>,
    batch_size: u32,
    cached: Mutex<Option<CachedBatch>>,
}

impl TsoClient {
    pub fn new(service: std::sync::Arc<TsoService>, batch_size: u32) -> Self {
        Self {
            service,
            batch_size: batch_size.max(1),
            cached: Mutex::new(None),
        }
    }

    /// Next timestamp, fetching a fresh batch when the cached one is
    /// exhausted or expired.
    pub fn next_timestamp(&self) -> KestrelResult<Timestamp> {
        let mut cached = self.cached.lock();
        let usable = cached
            .as_ref()
            .map(|c| c.next_idx < c.batch.count && c.fetched_at.elapsed() < c.batch.ttl)
            .unwrap_or(false);
        if !usable {
            *cached = Some(CachedBatch {
                batch: self.service.issue_batch(self.batch_size),
                next_idx: 0,
                fetched_at: Instant::now(),
            });
        }
        let entry = cached.as_mut().expect("batch just installed");
        let ts = entry.batch.timestamp(entry.next_idx);
        entry.next_idx += 1;
        Ok(ts)
    }
}

#[async_trait]
impl TimestampSource for TsoClient {
    async fn now_timestamp(&self) -> KestrelResult<Timestamp> {
        self.next_timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_batch_sequence_is_increasing() {
        let batch = TimestampBatch {
            base: 1_000,
            tso_id: 1,
            start_delta: 100,
            ttl: Duration::from_millis(100),
            count: 4,
            step: 10,
        };
        let ts: Vec<_> = (0..4).map(|i| batch.timestamp(i)).collect();
        for pair in ts.windows(2) {
            assert!(pair[0].compare_certain(&pair[1]).is_lt());
        }
        assert_eq!(ts[0].end(), 1_000);
        assert_eq!(ts[3].end(), 1_030);
    }

    #[test]
    fn test_batches_never_overlap() {
        let svc = TsoService::new(1);
        let mut last = Timestamp::ZERO;
        for _ in 0..1_000 {
            let batch = svc.issue_batch(8);
            assert!(batch.count >= 1);
            let first = batch.timestamp(0);
            let final_ts = batch.timestamp(batch.count - 1);
            assert!(first.compare_certain(&last).is_gt(), "{first} <= {last}");
            last = final_ts;
        }
    }

    #[test]
    fn test_exhausted_tick_advances() {
        // One timestamp per tick forces the slow path on every other call.
        let svc = TsoService::with_config(
            1,
            TsoConfig {
                start_delta: 0,
                batch_ttl: Duration::from_millis(100),
                step: 1_000,
            },
        );
        let a = svc.issue_batch(1).timestamp(0);
        let b = svc.issue_batch(1).timestamp(0);
        let c = svc.issue_batch(1).timestamp(0);
        assert!(a.compare_certain(&b).is_lt());
        assert!(b.compare_certain(&c).is_lt());
    }

    #[test]
    fn test_client_hands_out_increasing_timestamps() {
        let svc = Arc::new(TsoService::new(7));
        let client = TsoClient::new(svc, 4);
        let mut last = Timestamp::ZERO;
        for _ in 0..100 {
            let ts = client.next_timestamp().unwrap();
            assert!(ts.compare_certain(&last).is_gt());
            assert_eq!(ts.tso_id(), 7);
            last = ts;
        }
    }

    #[test]
    fn test_client_respects_batch_ttl() {
        let svc = Arc::new(TsoService::with_config(
            1,
            TsoConfig {
                start_delta: 0,
                batch_ttl: Duration::from_millis(0),
                step: 10,
            },
        ));
        let client = TsoClient::new(svc, 32);
        // Every call refetches (zero TTL) yet stays increasing.
        let a = client.next_timestamp().unwrap();
        let b = client.next_timestamp().unwrap();
        assert!(a.compare_certain(&b).is_lt());
    }
}
