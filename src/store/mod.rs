//! Storage primitives shared by the cache, pub/sub, and task queue engines.
//!
//! - [`Store`]: in-memory key/value map with optional absolute expiry, lazy
//!   expiry on read and a periodic background sweep.
//! - [`PersistentStore`]: a [`Store`] that snapshots itself to a JSON document
//!   (write-temp-then-rename) and reloads it on start.
//! - [`AppendLog`]: newline-delimited JSON log with fsync-on-append, ordered
//!   replay and crash-safe compaction, used by the durable bus and queue.

mod log;
mod memory;
mod persist;

use thiserror::Error;

pub use log::{AppendLog, LogError};
pub use memory::{DEFAULT_SWEEP_INTERVAL, Entry, Store, Ttl};
pub use persist::{DEFAULT_AUTO_SAVE_INTERVAL, PersistOptions, PersistentStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store snapshot could not be encoded or decoded: {0}")]
    Json(#[from] serde_json::Error),
}
