//! Offline action queue and synchronization for the field client.
//!
//! Mutating calls made while offline are validated, persisted to a
//! durable queue (large binaries extracted to a blob store), and
//! replayed in enqueue order once connectivity returns. Reads fall back
//! to the last successful response. Diagnostic logs buffer locally and
//! ship in batches. User-visible outcomes fan out over a lossy
//! notification channel.

pub mod backend;
pub mod config;
pub mod connectivity;
pub mod entry;
pub mod gateway;
pub mod lifecycle;
pub mod logbatch;
pub mod logging;
pub mod notify;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testutil;

pub use backend::{Backend, BackendRequest, BackendResponse, HttpBackend, ReplayOutcome};
pub use config::Config;
pub use connectivity::{ConnectivityObserver, SharedConnectivity};
pub use entry::{BlobRef, EntryDraft, Operation, QueueEntry};
pub use gateway::{Decision, FetchResult, FetchSource, MutationResult, RequestGateway};
pub use lifecycle::AppEvent;
pub use logbatch::LogBatcher;
pub use notify::{Notification, NotificationHub, Severity};
pub use store::{
  BlobStore, CachedResponse, LogLevel, LogRecord, LogStore, QueueStatus, QueueStorage,
  ResponseCache, SqliteQueueStore,
};
pub use sync::{DrainReport, SyncEngine};

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The fully wired subsystem: stores, gateway, sync engine, log batcher,
/// and the background trigger/flush tasks.
pub struct Subsystem {
  pub gateway: Arc<RequestGateway>,
  pub engine: Arc<SyncEngine>,
  pub batcher: Arc<LogBatcher>,
  pub notifications: NotificationHub,
  pub connectivity: Arc<SharedConnectivity>,
  queue: Arc<dyn QueueStorage>,
  foreground: mpsc::UnboundedSender<AppEvent>,
  tasks: Vec<JoinHandle<()>>,
  retry_cap: u32,
}

impl Subsystem {
  /// Wire everything up from config and spawn the background tasks.
  /// Must be called inside a tokio runtime.
  pub fn open(config: &Config) -> Result<Self> {
    let data_dir = config.data_dir()?;

    let blobs = Arc::new(BlobStore::open(&data_dir)?);
    let queue: Arc<dyn QueueStorage> =
      Arc::new(SqliteQueueStore::open(&data_dir, Arc::clone(&blobs))?);
    let cache = Arc::new(ResponseCache::open(&data_dir)?);
    let log_store = Arc::new(LogStore::open(&data_dir)?);

    let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new(config)?);
    let connectivity = SharedConnectivity::new(true);
    let observer: Arc<dyn ConnectivityObserver> = Arc::clone(&connectivity) as Arc<dyn ConnectivityObserver>;
    let notifications = NotificationHub::default();

    let gateway = Arc::new(RequestGateway::new(
      Arc::clone(&backend),
      Arc::clone(&queue),
      Arc::clone(&blobs),
      cache,
      Arc::clone(&observer),
      notifications.clone(),
    ));

    let engine = Arc::new(SyncEngine::new(
      Arc::clone(&queue),
      blobs,
      Arc::clone(&backend),
      Arc::clone(&observer),
      notifications.clone(),
      config.sync.retry_cap,
    ));

    let batcher = Arc::new(LogBatcher::new(
      log_store,
      backend,
      Arc::clone(&observer),
      config.logs.clone(),
    ));

    let (foreground, trigger_task) =
      lifecycle::spawn_triggers(Arc::clone(&engine), Arc::clone(&batcher), observer);
    let flush_task = Arc::clone(&batcher).spawn_interval();

    Ok(Self {
      gateway,
      engine,
      batcher,
      notifications,
      connectivity,
      queue,
      foreground,
      tasks: vec![trigger_task, flush_task],
      retry_cap: config.sync.retry_cap,
    })
  }

  /// Feed a reachability transition from the platform shell.
  pub fn set_online(&self, online: bool) {
    self.connectivity.set_online(online);
  }

  /// Feed an app-foreground transition from the platform shell.
  pub fn foregrounded(&self) {
    let _ = self.foreground.send(AppEvent::Foregrounded);
  }

  /// Queue health snapshot for UI badges.
  pub fn queue_status(&self) -> Result<QueueStatus> {
    self.queue.status(self.retry_cap)
  }

  /// Explicit user-initiated reset: drop all queued entries and blobs.
  pub fn reset_queue(&self) -> Result<()> {
    self.queue.clear()
  }

  /// Stop the background tasks.
  pub fn shutdown(&self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}
