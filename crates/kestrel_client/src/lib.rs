//! Transaction client for kestrel: snapshot acquisition from the TSO,
//! key-routed reads/writes/scans, TRH designation on first write, background
//! heartbeating, and commit/abort settlement.

pub mod txn;

pub use txn::{KestrelClient, QueryParams, Txn, TxnOptions, WriteOptions};
