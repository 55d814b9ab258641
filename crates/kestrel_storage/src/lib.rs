//! Per-partition storage structures: the multi-version indexer, the read
//! cache that enforces the read-before-write barrier, and the append-only
//! persistence log the transaction core writes through.

pub mod indexer;
pub mod plog;
pub mod read_cache;

pub use indexer::{Indexer, Versions};
pub use plog::{FilePlog, MemPlog, Plog, PlogEntry};
pub use read_cache::ReadCache;
