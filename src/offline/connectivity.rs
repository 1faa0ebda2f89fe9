//! Connectivity signal consumed by the offline queue.

use tokio::sync::watch;

/// Source of the current network state and its transitions
pub trait ConnectivityProvider: Send + Sync {
    /// Point-in-time query
    fn is_connected(&self) -> bool;

    /// Stream of connectivity changes. The receiver starts at the current value.
    fn changes(&self) -> watch::Receiver<bool>;
}

/// Connectivity driven by explicit calls, e.g. from a platform network
/// callback or from tests
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(connected: bool) -> Self {
        let (tx, _) = watch::channel(connected);
        Self { tx }
    }

    /// Publish a new state. Repeating the current value is not a transition.
    pub fn set_connected(&self, connected: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }
}

impl ConnectivityProvider for ManualConnectivity {
    fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    fn changes(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Connectivity that never drops
#[derive(Debug)]
pub struct AlwaysConnected {
    tx: watch::Sender<bool>,
}

impl Default for AlwaysConnected {
    fn default() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx }
    }
}

impl ConnectivityProvider for AlwaysConnected {
    fn is_connected(&self) -> bool {
        true
    }

    fn changes(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
