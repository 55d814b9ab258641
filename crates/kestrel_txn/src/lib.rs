//! Transaction-record management for one partition: the per-transaction
//! finite-state machine, heartbeat expiry, and finalize-completion tracking.

pub mod manager;


pub use manager::{TxnManager, TxnRecord, TxnStatsSnapshot};
