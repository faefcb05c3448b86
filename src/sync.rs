//! Sync engine: drains the durable queue against the backend.
//!
//! One drain pass at a time, entries strictly in enqueue order. Each
//! outcome is handled per entry: 2xx removes, 409 removes and notifies
//! (stale writes must not clobber newer server state), anything else
//! bumps the retry count and moves on. Entries at the retry cap are
//! skipped and left visible as stuck until an explicit recovery action.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendRequest, ReplayOutcome};
use crate::connectivity::ConnectivityObserver;
use crate::entry::{BlobRef, EntryDraft, Operation, QueueEntry};
use crate::notify::{Notification, NotificationHub};
use crate::store::{BlobStore, QueueStorage};

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// False when the pass was skipped (guard held, or offline).
  pub ran: bool,
  /// Entries replayed successfully and removed.
  pub sent: u32,
  /// Entries removed on a 409.
  pub conflicts: u32,
  /// Entries that failed and had their retry count bumped.
  pub failed: u32,
  /// Entries at the retry cap, not attempted.
  pub skipped_stuck: u32,
  /// Entries removed because their blob was unrecoverable.
  pub dropped: u32,
}

/// Released-on-drop handle for the single-drain flag.
struct DrainGuard<'a> {
  flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .ok()
      .map(|_| Self { flag })
  }
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::SeqCst);
  }
}

/// Replays queued operations whenever triggered.
pub struct SyncEngine {
  queue: Arc<dyn QueueStorage>,
  blobs: Arc<BlobStore>,
  backend: Arc<dyn Backend>,
  connectivity: Arc<dyn ConnectivityObserver>,
  notifications: NotificationHub,
  draining: AtomicBool,
  retry_cap: u32,
}

impl SyncEngine {
  pub fn new(
    queue: Arc<dyn QueueStorage>,
    blobs: Arc<BlobStore>,
    backend: Arc<dyn Backend>,
    connectivity: Arc<dyn ConnectivityObserver>,
    notifications: NotificationHub,
    retry_cap: u32,
  ) -> Self {
    Self {
      queue,
      blobs,
      backend,
      connectivity,
      notifications,
      draining: AtomicBool::new(false),
      retry_cap,
    }
  }

  /// Fire-and-forget drain trigger; never blocks the caller.
  pub fn trigger(self: &Arc<Self>) {
    let engine = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(e) = engine.drain().await {
        warn!(error = %e, "Drain pass failed");
      }
    });
  }

  /// Run one drain pass. A no-op if a pass is already in flight or the
  /// device is offline.
  pub async fn drain(&self) -> Result<DrainReport> {
    let mut report = DrainReport::default();

    let Some(_guard) = DrainGuard::acquire(&self.draining) else {
      debug!("Drain already in progress; trigger dropped");
      return Ok(report);
    };

    if !self.connectivity.is_online() {
      debug!("Offline; drain aborted");
      return Ok(report);
    }
    report.ran = true;

    let mut entries = self.queue.list()?;
    // Replay order is enqueue order, whatever order storage returned.
    entries.sort_by(|a, b| {
      a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
    });

    let mut crossed_cap = false;

    for mut entry in entries {
      if entry.retry_count >= self.retry_cap {
        report.skipped_stuck += 1;
        continue;
      }

      let payload = match self.resolve_payload(&entry) {
        Ok(payload) => payload,
        Err(reason) => {
          // The data is gone; retrying cannot help.
          warn!(id = %entry.id, %reason, "Removing entry with unrecoverable payload (data loss)");
          self.queue.remove(&entry.id)?;
          report.dropped += 1;
          continue;
        }
      };

      let body = match entry.operation {
        Operation::Delete => None,
        _ => Some(Value::Object(payload)),
      };
      let request = BackendRequest {
        operation: entry.operation,
        path: entry.target_path.clone(),
        body,
        headers: entry.headers.clone(),
        client_version: entry.client_version.clone(),
      };

      match ReplayOutcome::classify(self.backend.execute(&request).await) {
        ReplayOutcome::Success(status) => {
          debug!(id = %entry.id, status, "Replayed queued entry");
          self.queue.remove(&entry.id)?;
          report.sent += 1;
        }
        ReplayOutcome::Conflict => {
          info!(id = %entry.id, path = %entry.target_path, "Replay conflicted; dropping entry");
          self
            .notifications
            .publish(Notification::conflict(&entry.target_path));
          self.queue.remove(&entry.id)?;
          report.conflicts += 1;
        }
        ReplayOutcome::Retryable(reason) => {
          entry.retry_count += 1;
          self.queue.update(&entry)?;
          report.failed += 1;
          debug!(
            id = %entry.id,
            retry_count = entry.retry_count,
            %reason,
            "Replay failed; will retry"
          );
          if entry.retry_count >= self.retry_cap {
            crossed_cap = true;
          }
        }
      }
    }

    if report.sent > 0 {
      self
        .notifications
        .publish(Notification::sync_completed(report.sent));
    }
    if crossed_cap {
      self.notifications.publish(Notification::retries_exhausted());
    }

    info!(
      sent = report.sent,
      conflicts = report.conflicts,
      failed = report.failed,
      skipped = report.skipped_stuck,
      dropped = report.dropped,
      "Drain pass finished"
    );

    Ok(report)
  }

  /// Resolve an entry's payload, reading the blob back in if present.
  /// An unreadable blob makes the whole entry unrecoverable.
  fn resolve_payload(&self, entry: &QueueEntry) -> std::result::Result<serde_json::Map<String, Value>, String> {
    let mut payload = entry.payload.clone();

    if let Some(blob) = &entry.blob {
      let bytes = self
        .blobs
        .read(&blob.path)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("blob {} is missing", blob.path))?;
      let content = String::from_utf8(bytes)
        .map_err(|_| format!("blob {} is not valid payload content", blob.path))?;
      payload.insert(blob.field.clone(), Value::String(content));
    }

    Ok(payload)
  }

  /// Re-enqueue every stuck entry as a fresh one (new id, new timestamp,
  /// zero retries) and remove the old entry. Explicit user action.
  pub fn requeue_stuck(&self) -> Result<u32> {
    let Some(_guard) = DrainGuard::acquire(&self.draining) else {
      return Err(eyre!("A sync pass is in progress; try again shortly"));
    };

    let stuck = self.queue.stuck(self.retry_cap)?;
    let mut requeued = 0;

    for entry in stuck {
      let mut draft = EntryDraft::new(entry.operation, entry.target_path.clone())
        .with_payload(entry.payload.clone())
        .with_headers(entry.headers.clone());

      if let Some(blob) = &entry.blob {
        // Copy the bytes first: removing the old entry deletes its blob.
        match self.blobs.read(&blob.path)? {
          Some(bytes) => {
            let path = self.blobs.put(&bytes)?;
            draft.blob = Some(BlobRef {
              path,
              field: blob.field.clone(),
            });
          }
          None => {
            warn!(id = %entry.id, "Stuck entry's blob is gone; discarding (data loss)");
            self.queue.remove(&entry.id)?;
            continue;
          }
        }
      }

      self.queue.append(draft)?;
      self.queue.remove(&entry.id)?;
      requeued += 1;
    }

    info!(requeued, "Requeued stuck entries");
    Ok(requeued)
  }

  /// Remove every stuck entry (and its blob). Explicit user action.
  pub fn discard_stuck(&self) -> Result<u32> {
    let Some(_guard) = DrainGuard::acquire(&self.draining) else {
      return Err(eyre!("A sync pass is in progress; try again shortly"));
    };

    let stuck = self.queue.stuck(self.retry_cap)?;
    let mut discarded = 0;
    for entry in &stuck {
      self.queue.remove(&entry.id)?;
      discarded += 1;
    }

    info!(discarded, "Discarded stuck entries");
    Ok(discarded)
  }
}
