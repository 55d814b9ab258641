use serde::{Deserialize, Serialize};
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{KestrelError, KestrelResult};
use crate::types::Key;

/// Partition version identity: carried in every request and compared by the
/// owning partition. Any mismatch means the client's map is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Pvid {
    pub id: u64,
    pub range_version: u64,
    pub assignment_version: u64,
}

/// How partition keys map onto partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashScheme {
    /// Partitions own contiguous ranges of raw partition-key strings.
    Range,
    /// Partitions own contiguous ranges of the xxh3 hash space.
    HashXx,
}

/// Storage driver tag for the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StorageDriver {
    #[default]
    InMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollectionCapacity {
    pub data_capacity_mb: u64,
    pub read_iops: u64,
    pub write_iops: u64,
}

impl Default for CollectionCapacity {
    fn default() -> Self {
        Self {
            data_capacity_mb: 1024,
            read_iops: 100_000,
            write_iops: 100_000,
        }
    }
}

/// Collection-wide metadata distributed by the CPO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub name: String,
    pub hash_scheme: HashScheme,
    pub storage_driver: StorageDriver,
    pub capacity: CollectionCapacity,
    pub retention_period: Duration,
    pub heartbeat_deadline: Duration,
}

/// The slice of key space one partition owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OwnershipRange {
    /// `[start, end)` over partition-key strings; empty `end` is open.
    Range { start: String, end: String },
    /// `[start, end)` over the xxh3 hash space; the final partition's `end`
    /// is `u64::MAX` and is owned inclusively.
    Hash { start: u64, end: u64 },
}

impl OwnershipRange {
    pub fn owns(&self, partition_key: &str) -> bool {
        match self {
            OwnershipRange::Range { start, end } => {
                partition_key >= start.as_str() && (end.is_empty() || partition_key < end.as_str())
            }
            OwnershipRange::Hash { start, end } => {
                let h = xxh3_64(partition_key.as_bytes());
                h >= *start && (h < *end || *end == u64::MAX)
            }
        }
    }
}

/// One partition of a collection, as seen by routing code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub pvid: Pvid,
    pub range: OwnershipRange,
    pub endpoint: String,
}

impl PartitionDescriptor {
    pub fn owns(&self, key: &Key) -> bool {
        self.range.owns(&key.partition_key)
    }
}

/// Ordered set of partition descriptors for one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMap {
    pub partitions: Vec<PartitionDescriptor>,
}

impl PartitionMap {
    /// Build a range-partitioned map. `range_ends` must have one entry per
    /// endpoint and its final entry must be the open bound `""`.
    pub fn from_range_ends(endpoints: &[String], range_ends: &[String]) -> KestrelResult<Self> {
        if endpoints.is_empty() {
            return Err(KestrelError::BadParameter("no endpoints".into()));
        }
        if range_ends.len() != endpoints.len() {
            return Err(KestrelError::BadParameter(format!(
                "range end count {} does not match endpoint count {}",
                range_ends.len(),
                endpoints.len()
            )));
        }
        if range_ends.last().map(String::as_str) != Some("") {
            return Err(KestrelError::BadParameter(
                "last range end must be the open bound \"\"".into(),
            ));
        }
        let mut partitions = Vec::with_capacity(endpoints.len());
        let mut start = String::new();
        for (i, (endpoint, end)) in endpoints.iter().zip(range_ends).enumerate() {
            partitions.push(PartitionDescriptor {
                pvid: Pvid {
                    id: i as u64,
                    range_version: 1,
                    assignment_version: 1,
                },
                range: OwnershipRange::Range {
                    start: std::mem::take(&mut start),
                    end: end.clone(),
                },
                endpoint: endpoint.clone(),
            });
            start = end.clone();
        }
        Ok(Self { partitions })
    }

    /// Build a hash-partitioned map with uniform hash ranges.
    pub fn hashed(endpoints: &[String]) -> KestrelResult<Self> {
        if endpoints.is_empty() {
            return Err(KestrelError::BadParameter("no endpoints".into()));
        }
        let n = endpoints.len() as u64;
        let range_size = u64::MAX / n;
        let partitions = endpoints
            .iter()
            .enumerate()
            .map(|(i, endpoint)| {
                let i = i as u64;
                PartitionDescriptor {
                    pvid: Pvid {
                        id: i,
                        range_version: 1,
                        assignment_version: 1,
                    },
                    range: OwnershipRange::Hash {
                        start: i * range_size,
                        end: if i == n - 1 { u64::MAX } else { (i + 1) * range_size },
                    },
                    endpoint: endpoint.clone(),
                }
            })
            .collect();
        Ok(Self { partitions })
    }

    /// Locate the partition serving `key`.
    ///
    /// An empty partition key addresses the first partition (or the last for
    /// reverse scans). For reverse exclusive scans starting exactly on a
    /// range boundary, the scan belongs to the preceding partition.
    pub fn get_partition_for_key(
        &self,
        key: &Key,
        reverse: bool,
        exclusive: bool,
    ) -> Option<&PartitionDescriptor> {
        if key.partition_key.is_empty() {
            return if reverse {
                self.partitions.last()
            } else {
                self.partitions.first()
            };
        }
        let idx = self.partitions.iter().position(|p| p.owns(key))?;
        if reverse && exclusive {
            if let OwnershipRange::Range { start, .. } = &self.partitions[idx].range {
                if !start.is_empty() && *start == key.partition_key && idx > 0 {
                    return Some(&self.partitions[idx - 1]);
                }
            }
        }
        Some(&self.partitions[idx])
    }
}

/// A collection as distributed to clients: metadata plus partition map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub metadata: CollectionMetadata,
    pub partition_map: PartitionMap,
}
