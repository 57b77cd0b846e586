//! Shutdown coordination for the test server.

use tokio::sync::broadcast;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that the adapter, the controller and `main`
/// subscribe to. Clones share the same channel, so the controller can
/// trigger the shutdown that `main` waits for.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clone_shares_channel() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        let handle = shutdown.clone();
        assert_eq!(handle.receiver_count(), 1);

        handle.trigger();
        assert!(rx.recv().await.is_ok());
    }
}
