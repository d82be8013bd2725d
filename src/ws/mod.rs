// =============================================================================
// WebSocket hub — connections, subscriptions, push
// =============================================================================

pub mod connection;
pub mod handler;
pub mod messages;
pub mod publisher;
pub mod subscription;

pub use connection::{ConnectionRegistry, INACTIVE_TIMEOUT};
pub use messages::SubscriptionType;
pub use publisher::PricePublisher;
pub use subscription::SubscriptionManager;

/// The connection registry and subscription tables, shared by the axum
/// endpoint, the message handler, and the publisher.
#[derive(Default)]
pub struct WsHub {
    pub connections: ConnectionRegistry,
    pub subscriptions: SubscriptionManager,
}

impl WsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full disconnect: clear subscriptions, then drop the connection.
    pub fn disconnect(&self, client_id: &str) {
        self.subscriptions.unsubscribe_all(client_id);
        self.connections.unregister(client_id);
    }

    /// Periodic sweep dropping silent clients and their subscriptions.
    pub fn cleanup_inactive(&self) -> usize {
        let removed = self.connections.cleanup_inactive(INACTIVE_TIMEOUT);
        for client_id in &removed {
            self.subscriptions.unsubscribe_all(client_id);
        }
        removed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_clears_subscriptions() {
        let hub = WsHub::new();
        let _rx = hub.connections.register("c1");
        hub.subscriptions
            .subscribe("c1", SubscriptionType::Strategy, "volume_wave");

        hub.disconnect("c1");
        assert!(!hub.connections.is_connected("c1"));
        assert!(hub
            .subscriptions
            .subscribers(SubscriptionType::Strategy, "volume_wave")
            .is_empty());
    }
}
