//! Connectivity and app-lifecycle triggers.
//!
//! Two independent sources wake the sync engine: a reachability
//! transition to online, and the app returning to the foreground. Both
//! are fire-and-forget; the engine's own guard deduplicates overlapping
//! triggers.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connectivity::ConnectivityObserver;
use crate::logbatch::LogBatcher;
use crate::sync::SyncEngine;

/// Lifecycle signals delivered by the platform shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
  /// The application became active again.
  Foregrounded,
}

/// Spawn the trigger task. Returns the sender for lifecycle events and
/// the task handle.
pub fn spawn_triggers(
  engine: Arc<SyncEngine>,
  batcher: Arc<LogBatcher>,
  connectivity: Arc<dyn ConnectivityObserver>,
) -> (mpsc::UnboundedSender<AppEvent>, JoinHandle<()>) {
  let (tx, mut rx) = mpsc::unbounded_channel();
  let mut online_rx = connectivity.subscribe();

  let handle = tokio::spawn(async move {
    loop {
      tokio::select! {
        changed = online_rx.changed() => {
          if changed.is_err() {
            break;
          }
          if *online_rx.borrow_and_update() {
            debug!("Connectivity restored; triggering sync and log flush");
            engine.trigger();
            batcher.trigger();
          }
        }
        event = rx.recv() => {
          match event {
            Some(AppEvent::Foregrounded) => {
              debug!("App foregrounded; triggering sync");
              engine.trigger();
            }
            None => break,
          }
        }
      }
    }
  });

  (tx, handle)
}
