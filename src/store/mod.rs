//! Durable storage for the offline subsystem.
//!
//! Each concern gets its own namespace under the data dir so corruption in
//! one cannot take down the others:
//! - `queue.db` — pending mutating operations
//! - `cache.db` — last-known-good GET responses
//! - `logs.db` — buffered diagnostic records
//! - `blobs/` — large binary payload content

mod blobs;
mod cache;
mod logs;
mod queue;

pub use blobs::BlobStore;
pub use cache::{CachedResponse, ResponseCache};
pub use logs::{LogLevel, LogRecord, LogStore};
pub use queue::{QueueStatus, QueueStorage, SqliteQueueStore};
