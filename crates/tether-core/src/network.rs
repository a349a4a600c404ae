//! Connectivity signal published by the host.

use std::sync::Arc;

use tokio::sync::watch;

/// Last known network status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkStatus {
    Online,
    #[default]
    Offline,
}

impl NetworkStatus {
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Broadcasts [`NetworkStatus`] transitions to the background scheduler.
///
/// The host owns the publishing side and calls [`Reachability::set`] from its
/// platform connectivity callback. Clones share one channel.
#[derive(Debug, Clone)]
pub struct Reachability {
    sender: Arc<watch::Sender<NetworkStatus>>,
}

impl Reachability {
    pub fn new(initial: NetworkStatus) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publish a status; listeners are only woken on actual transitions.
    pub fn set(&self, status: NetworkStatus) {
        self.sender.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                tracing::debug!("Network status changed: {current:?} -> {status:?}");
                *current = status;
                true
            }
        });
    }

    pub fn status(&self) -> NetworkStatus {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.sender.subscribe()
    }
}

impl Default for Reachability {
    fn default() -> Self {
        Self::new(NetworkStatus::Online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribers_see_transitions_only() {
        let reachability = Reachability::new(NetworkStatus::Offline);
        let mut receiver = reachability.subscribe();

        reachability.set(NetworkStatus::Offline);
        assert!(!receiver.has_changed().unwrap());

        reachability.set(NetworkStatus::Online);
        assert!(receiver.has_changed().unwrap());
        receiver.changed().await.unwrap();
        assert!(receiver.borrow_and_update().is_online());
        assert_eq!(reachability.status(), NetworkStatus::Online);
    }
}
