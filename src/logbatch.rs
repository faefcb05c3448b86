//! Diagnostic log batcher.
//!
//! Structurally a small sibling of the sync engine: records buffer
//! durably, and a flush ships the entire buffer as one batch call. The
//! buffer is only trimmed after a confirmed acknowledgment; a failed
//! flush leaves everything in place for the next attempt. Logs are
//! best-effort and never block the action queue — there is no retry
//! counter and no terminal state.

use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::config::LogSettings;
use crate::connectivity::ConnectivityObserver;
use crate::store::{LogLevel, LogRecord, LogStore};

/// Released-on-drop handle for the single-flush flag.
struct FlushGuard<'a> {
  flag: &'a AtomicBool,
}

impl<'a> FlushGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .ok()
      .map(|_| Self { flag })
  }
}

impl Drop for FlushGuard<'_> {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::SeqCst);
  }
}

/// Buffers log records and flushes them in batches.
pub struct LogBatcher {
  store: Arc<LogStore>,
  backend: Arc<dyn Backend>,
  connectivity: Arc<dyn ConnectivityObserver>,
  flushing: AtomicBool,
  settings: LogSettings,
}

impl LogBatcher {
  pub fn new(
    store: Arc<LogStore>,
    backend: Arc<dyn Backend>,
    connectivity: Arc<dyn ConnectivityObserver>,
    settings: LogSettings,
  ) -> Self {
    Self {
      store,
      backend,
      connectivity,
      flushing: AtomicBool::new(false),
      settings,
    }
  }

  /// Buffer a record; kicks off a flush when the buffer hits the batch
  /// size threshold while online.
  pub fn record(self: &Arc<Self>, record: LogRecord) -> Result<()> {
    self.store.append(&record)?;

    if self.store.pending_count()? >= self.settings.batch_size && self.connectivity.is_online() {
      self.trigger();
    }
    Ok(())
  }

  /// Convenience constructor-and-record with the configured platform tag.
  pub fn log(self: &Arc<Self>, level: LogLevel, message: impl Into<String>) -> Result<()> {
    self.record(LogRecord::new(level, message, self.settings.platform.clone()))
  }

  /// Fire-and-forget flush trigger; never blocks the caller.
  pub fn trigger(self: &Arc<Self>) {
    let batcher = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(e) = batcher.flush().await {
        warn!(error = %e, "Log flush failed");
      }
    });
  }

  /// Ship the whole current buffer as one batch. Returns the number of
  /// records acknowledged and deleted; 0 when skipped or unacknowledged.
  pub async fn flush(&self) -> Result<u32> {
    let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
      debug!("Log flush already in progress; trigger dropped");
      return Ok(0);
    };

    if !self.connectivity.is_online() {
      return Ok(0);
    }

    let Some((records, high_water)) = self.store.snapshot()? else {
      return Ok(0);
    };

    match self.backend.push_logs(&records).await {
      Ok(response) if response.is_success() => {
        self.store.delete_through(high_water)?;
        debug!(count = records.len(), "Log batch acknowledged");
        Ok(records.len() as u32)
      }
      Ok(response) => {
        debug!(status = response.status, "Log batch rejected; keeping buffer");
        Ok(0)
      }
      Err(e) => {
        debug!(error = %e, "Log batch upload failed; keeping buffer");
        Ok(0)
      }
    }
  }

  /// Spawn the wall-clock flush loop.
  pub fn spawn_interval(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
    let every = std::time::Duration::from_secs(self.settings.flush_interval_secs);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      // The first tick fires immediately; skip it.
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if let Err(e) = self.flush().await {
          warn!(error = %e, "Scheduled log flush failed");
        }
      }
    })
  }

  /// Number of records waiting in the buffer.
  pub fn pending_count(&self) -> Result<u64> {
    self.store.pending_count()
  }
}
