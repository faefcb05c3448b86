//! Fire-and-forget notification fan-out for user-visible sync outcomes.
//!
//! Lossy by design: if nobody is subscribed (or a subscriber lags), the
//! notification is dropped. UI layers subscribe to show transient feedback.

use tokio::sync::broadcast;

/// How prominently the UI should surface a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
  Info,
  Warning,
  Error,
}

/// A user-visible notification.
#[derive(Debug, Clone)]
pub struct Notification {
  pub title: String,
  pub message: String,
  pub severity: Severity,
}

impl Notification {
  /// A mutating call was accepted while offline.
  pub fn queued() -> Self {
    Self {
      title: "Saved offline".into(),
      message: "Your change was saved and will be sent when you're back online.".into(),
      severity: Severity::Info,
    }
  }

  /// A drain pass sent one or more entries.
  pub fn sync_completed(sent: u32) -> Self {
    Self {
      title: "Sync complete".into(),
      message: format!("Sync completed, {} items sent.", sent),
      severity: Severity::Info,
    }
  }

  /// The server rejected a stale write; the entry was dropped.
  pub fn conflict(target_path: &str) -> Self {
    Self {
      title: "Sync conflict".into(),
      message: format!(
        "Your change to {} conflicts with newer data on the server and needs manual review.",
        target_path
      ),
      severity: Severity::Warning,
    }
  }

  /// One or more entries crossed the retry cap this drain.
  pub fn retries_exhausted() -> Self {
    Self {
      title: "Sync problems".into(),
      message: "Some items could not be sent. They will be kept until you retry or discard them."
        .into(),
      severity: Severity::Error,
    }
  }
}

/// Publish/subscribe hub for notifications.
#[derive(Clone)]
pub struct NotificationHub {
  tx: broadcast::Sender<Notification>,
}

impl NotificationHub {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Publish to all current subscribers. No delivery guarantee.
  pub fn publish(&self, notification: Notification) {
    // A send error just means nobody is listening right now.
    let _ = self.tx.send(notification);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.tx.subscribe()
  }
}

impl Default for NotificationHub {
  fn default() -> Self {
    Self::new(32)
  }
}
