//! Cluster plumbing around the partition core: the control plane oracle and
//! its client-side routing cache, the timestamp oracle and its batch client,
//! and the in-process transport wiring partitions together.

pub mod cpo;
pub mod local;
pub mod transport;
pub mod tso;

pub use cpo::{CpoClient, CpoService};
pub use local::LocalCluster;
pub use transport::{routed_request, LocalTransport, RoutedPeers};
pub use tso::{TimestampBatch, TsoClient, TsoService};
