//! The per-partition snapshot-isolation transaction module: verb handlers
//! over a multi-version indexer, a read cache and a transaction-record table,
//! with conflicts arbitrated by the deterministic push protocol.

pub mod module;
mod module_query;
mod module_write;
pub mod peers;
pub mod push;

pub use module::{PartitionModule, PartitionState};
pub use peers::PeerRouter;
