//! Shutdown Coordinator
//!
//! Publish/subscribe fan-out of drain and close signals to active streams,
//! plus an inventory of which streams are open. With hundreds of short-lived
//! connections per minute, every stream must unsubscribe (drop its receiver)
//! and untrack itself during cleanup or the inventory leaks.

use dashmap::DashSet;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

/// Signals delivered to every subscribed stream. Each stream filters targeted
/// closes by its own connection id.
#[derive(Debug, Clone)]
pub enum ShutdownSignal {
    /// Drain everything: advise clients, then close after a grace period
    DrainAll {
        message: String,
        reconnect_delay_ms: u64,
    },
    /// Close exactly one stream
    CloseStream(Uuid),
}

pub struct ShutdownCoordinator {
    tx: broadcast::Sender<ShutdownSignal>,
    tracked: DashSet<Uuid>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            tracked: DashSet::new(),
        }
    }

    /// Subscribe to shutdown signals. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.tx.subscribe()
    }

    /// Add a stream to the inventory
    pub fn track_stream(&self, connection_id: Uuid) {
        self.tracked.insert(connection_id);
    }

    /// Remove a stream from the inventory. Idempotent.
    pub fn untrack_stream(&self, connection_id: Uuid) {
        self.tracked.remove(&connection_id);
    }

    /// Number of streams currently tracked
    pub fn active_streams(&self) -> usize {
        self.tracked.len()
    }

    /// Broadcast a drain to all subscribed streams. Returns how many
    /// subscribers the signal reached.
    pub fn drain_all(&self, message: &str, reconnect_delay_ms: u64) -> usize {
        info!(
            tracked = self.active_streams(),
            message, "draining all active streams"
        );
        self.tx
            .send(ShutdownSignal::DrainAll {
                message: message.to_string(),
                reconnect_delay_ms,
            })
            .unwrap_or(0)
    }

    /// Ask one stream to close
    pub fn close_stream(&self, connection_id: Uuid) {
        let _ = self.tx.send(ShutdownSignal::CloseStream(connection_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_track_untrack_inventory() {
        let coordinator = ShutdownCoordinator::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        coordinator.track_stream(a);
        coordinator.track_stream(b);
        assert_eq!(coordinator.active_streams(), 2);

        coordinator.untrack_stream(a);
        coordinator.untrack_stream(a);
        assert_eq!(coordinator.active_streams(), 1);
    }

    #[tokio::test]
    async fn test_drain_reaches_all_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx1 = coordinator.subscribe();
        let mut rx2 = coordinator.subscribe();

        let reached = coordinator.drain_all("maintenance", 2000);
        assert_eq!(reached, 2);

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                ShutdownSignal::DrainAll {
                    message,
                    reconnect_delay_ms,
                } => {
                    assert_eq!(message, "maintenance");
                    assert_eq!(reconnect_delay_ms, 2000);
                }
                other => panic!("expected DrainAll, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_targeted_close_carries_connection_id() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();
        let target = Uuid::new_v4();

        coordinator.close_stream(target);

        match rx.recv().await.unwrap() {
            ShutdownSignal::CloseStream(id) => assert_eq!(id, target),
            other => panic!("expected CloseStream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drain_with_no_subscribers_is_safe() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.drain_all("nobody home", 1000), 0);
    }
}
