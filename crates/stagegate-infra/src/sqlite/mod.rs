//! SQLite storage layer.
//!
//! Run store implementation backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod pool;
pub mod run_store;
