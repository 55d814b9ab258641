use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-partition tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Max tracked intervals in the read cache before eviction raises the
    /// min-tracked watermark.
    pub read_cache_capacity: usize,
    /// How often the heartbeat sweeper looks for expired transactions.
    pub heartbeat_sweep_interval_ms: u64,
    /// How often the retention timestamp is refreshed from the TSO.
    pub retention_refresh_interval_ms: u64,
    /// Push-induced retries allowed per original request.
    pub push_retries: u32,
    /// Row cap applied to each query response page.
    pub query_page_row_limit: usize,
    /// Approximate byte cap applied to each query response page.
    pub query_page_byte_limit: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            read_cache_capacity: 10_000,
            heartbeat_sweep_interval_ms: 100,
            retention_refresh_interval_ms: 1_000,
            push_retries: 1,
            query_page_row_limit: 128,
            query_page_byte_limit: 1 << 20,
        }
    }
}

impl PartitionConfig {
    pub fn heartbeat_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_sweep_interval_ms)
    }

    pub fn retention_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.retention_refresh_interval_ms)
    }
}

/// Client-side timeouts and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub cpo_request_timeout_ms: u64,
    pub cpo_request_backoff_ms: u64,
    pub partition_request_timeout_ms: u64,
    /// Routed-request reissues after a partition map refresh.
    pub partition_request_retries: u32,
    /// Timestamps fetched per TSO batch.
    pub tso_batch_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cpo_request_timeout_ms: 100,
            cpo_request_backoff_ms: 500,
            partition_request_timeout_ms: 100,
            partition_request_retries: 1,
            tso_batch_size: 32,
        }
    }
}

impl ClientConfig {
    pub fn cpo_request_timeout(&self) -> Duration {
        Duration::from_millis(self.cpo_request_timeout_ms)
    }

    pub fn cpo_request_backoff(&self) -> Duration {
        Duration::from_millis(self.cpo_request_backoff_ms)
    }

    pub fn partition_request_timeout(&self) -> Duration {
        Duration::from_millis(self.partition_request_timeout_ms)
    }
}
