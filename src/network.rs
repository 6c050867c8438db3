//! Connectivity state shared between the host and the job executor.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Host-driven view of network connectivity.
///
/// Jobs scheduled with a network constraint wait in
/// [`NetworkMonitor::wait_until_connected`] while the host reports offline.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor {
    #[must_use]
    pub fn new(connected: bool) -> Self {
        let (state, _) = watch::channel(connected);
        Self {
            state: Arc::new(state),
        }
    }

    /// Records a connectivity change; waiting jobs resume when it becomes `true`.
    pub fn set_connected(&self, connected: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
        if changed {
            info!(connected, "network connectivity changed");
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once the network is reported connected.
    pub async fn wait_until_connected(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = receiver.wait_for(|connected| *connected).await;
    }
}
