//! Network connectivity signal
//!
//! The manager treats connectivity as an external input: something outside of
//! it (the reachability probe, a platform hook, a test) flips the signal and
//! the manager reacts to every change.

mod probe;

pub use probe::{ProbeHandle, ReachabilityProbe};

use tokio::sync::watch;
use tracing::info;

/// Create a connectivity signal and the watch side handed to the manager
pub fn connectivity(initially_online: bool) -> (ConnectivitySignal, ConnectivityWatch) {
    let (tx, rx) = watch::channel(initially_online);
    (ConnectivitySignal { tx }, ConnectivityWatch { rx })
}

/// Publishing side of the connectivity signal
#[derive(Debug, Clone)]
pub struct ConnectivitySignal {
    tx: watch::Sender<bool>,
}

impl ConnectivitySignal {
    /// Report the current connectivity; only actual changes are published
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });

        if changed {
            info!("[NET] Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }

    /// Last published connectivity
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Create another watch on this signal
    pub fn watch(&self) -> ConnectivityWatch {
        ConnectivityWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side of the connectivity signal
#[derive(Debug, Clone)]
pub struct ConnectivityWatch {
    rx: watch::Receiver<bool>,
}

impl ConnectivityWatch {
    /// Whether the device currently reports itself online
    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the next change and return the new value
    ///
    /// Returns `None` once every signal has been dropped.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_only_changes_are_published() {
        let (signal, mut watch) = connectivity(true);
        assert!(watch.is_online());

        signal.set_online(true);
        signal.set_online(false);
        assert_eq!(watch.changed().await, Some(false));
        assert!(!signal.is_online());

        signal.set_online(false);
        signal.set_online(true);
        assert_eq!(watch.changed().await, Some(true));
    }

    #[tokio::test]
    async fn test_watch_ends_when_signal_dropped() {
        let (signal, mut watch) = connectivity(false);
        drop(signal);
        assert_eq!(watch.changed().await, None);
    }
}
