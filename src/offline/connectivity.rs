//! Online/offline signal shared by the write paths.

use tokio::sync::watch;
use tracing::info;

/// Connectivity state fed by the platform (network monitor, failed health checks).
///
/// Cloning shares the same underlying signal.
#[derive(Clone)]
pub struct Connectivity {
  tx: watch::Sender<bool>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record a transition. Repeated reports of the same state are ignored.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if changed {
      if online {
        info!("Connection restored");
      } else {
        info!("Connection lost, writes will be queued");
      }
    }
  }

  /// Watch for transitions, e.g. to drain the offline queue on reconnect.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_transitions_are_observed() {
    let connectivity = Connectivity::default();
    let mut rx = connectivity.subscribe();
    assert!(connectivity.is_online());

    connectivity.set_online(false);
    rx.changed().await.unwrap();
    assert!(!*rx.borrow_and_update());
    assert!(!connectivity.clone().is_online());

    // Same state again is not a transition
    connectivity.set_online(false);
    assert!(!rx.has_changed().unwrap());
  }
}
