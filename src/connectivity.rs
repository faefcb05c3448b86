//! Connectivity state: current-state query plus change subscription.

use std::sync::Arc;
use tokio::sync::watch;

/// Observer over the device's network reachability.
///
/// The platform shell feeds the real state; the gateway queries it before
/// every call and the lifecycle task watches it for restore transitions.
pub trait ConnectivityObserver: Send + Sync {
  /// Whether the device currently has connectivity.
  fn is_online(&self) -> bool;

  /// Subscribe to state changes. The receiver yields the new state on
  /// every transition.
  fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Shared connectivity handle updated by the platform reachability hook.
pub struct SharedConnectivity {
  tx: watch::Sender<bool>,
}

impl SharedConnectivity {
  /// Start with the given initial state.
  pub fn new(online: bool) -> Arc<Self> {
    let (tx, _) = watch::channel(online);
    Arc::new(Self { tx })
  }

  /// Record a reachability transition. No-op if the state is unchanged.
  pub fn set_online(&self, online: bool) {
    self.tx.send_if_modified(|state| {
      if *state != online {
        *state = online;
        true
      } else {
        false
      }
    });
  }
}

impl ConnectivityObserver for SharedConnectivity {
  fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_state_query_and_transition() {
    let conn = SharedConnectivity::new(false);
    assert!(!conn.is_online());

    let mut rx = conn.subscribe();
    conn.set_online(true);

    rx.changed().await.unwrap();
    assert!(*rx.borrow());
    assert!(conn.is_online());
  }

  #[tokio::test]
  async fn test_unchanged_state_does_not_notify() {
    let conn = SharedConnectivity::new(true);
    let mut rx = conn.subscribe();

    conn.set_online(true);
    assert!(!rx.has_changed().unwrap());
  }
}
