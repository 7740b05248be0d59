//! Broadcast of connection events to observers.
//!
//! Every subscriber gets its own receiver; dropping it ends the
//! subscription. Slow subscribers lag and lose the oldest events rather
//! than blocking the connection layer.
//!
//! Lifecycle events (state changes and exits) are also published on a
//! second channel, so a chatty server's stderr cannot push them out of a
//! lifecycle subscriber's buffer.

use crate::logs::LogEntry;
use crate::state::ConnectionState;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Default capacity of the channel carrying every event.
const DEFAULT_CAPACITY: usize = 1024;

/// Capacity of the lifecycle-only channel.
const LIFECYCLE_CAPACITY: usize = 256;

/// Something observers may want to react to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    #[serde(rename_all = "camelCase")]
    StateChanged {
        server_id: String,
        previous: ConnectionState,
        state: ConnectionState,
    },
    /// A server that had started stopped on its own.
    #[serde(rename_all = "camelCase")]
    ServerExited {
        server_id: String,
        code: Option<i32>,
        reason: String,
    },
    Log { entry: LogEntry },
    #[serde(rename_all = "camelCase")]
    Notification {
        server_id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
}

impl ConnectionEvent {
    pub fn server_id(&self) -> &str {
        match self {
            Self::StateChanged { server_id, .. }
            | Self::ServerExited { server_id, .. }
            | Self::Notification { server_id, .. } => server_id,
            Self::Log { entry } => &entry.server_id,
        }
    }

    /// State changes and exits, as opposed to logs and notifications.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::StateChanged { .. } | Self::ServerExited { .. })
    }
}

/// Fan-out point for [`ConnectionEvent`]s.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<ConnectionEvent>,
    lifecycle: broadcast::Sender<ConnectionEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self { tx, lifecycle }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: ConnectionEvent) {
        // Ignore send errors (no receivers)
        if event.is_lifecycle() {
            let _ = self.lifecycle.send(event.clone());
        }
        let _ = self.tx.send(event);
    }

    /// Every event.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    /// Only `StateChanged` and `ServerExited` events.
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.lifecycle.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count() + self.lifecycle.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let hub = EventHub::default();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.publish(ConnectionEvent::ServerExited {
            server_id: "fs".to_string(),
            code: Some(1),
            reason: "crashed".to_string(),
        });

        assert_eq!(a.recv().await.unwrap().server_id(), "fs");
        assert_eq!(b.recv().await.unwrap().server_id(), "fs");
    }

    #[test]
    fn test_dropping_receiver_unsubscribes() {
        let hub = EventHub::default();
        let rx = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(rx);
        assert_eq!(hub.subscriber_count(), 0);

        // Publishing without subscribers is fine.
        hub.publish(ConnectionEvent::Notification {
            server_id: "x".to_string(),
            method: "m".to_string(),
            params: None,
        });
    }

    #[tokio::test]
    async fn test_lifecycle_survives_log_flood() {
        let hub = EventHub::new(8);
        let mut all = hub.subscribe();
        let mut lifecycle = hub.subscribe_lifecycle();

        hub.publish(ConnectionEvent::StateChanged {
            server_id: "fs".to_string(),
            previous: ConnectionState::Connecting,
            state: ConnectionState::connected(),
        });
        for i in 0..100 {
            hub.publish(ConnectionEvent::Notification {
                server_id: "fs".to_string(),
                method: format!("notifications/message/{i}"),
                params: None,
            });
        }

        assert!(matches!(
            all.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        let event = lifecycle.recv().await.unwrap();
        assert!(matches!(event, ConnectionEvent::StateChanged { .. }));
        assert!(lifecycle.try_recv().is_err());
    }

    #[test]
    fn test_event_serialization() {
        let event = ConnectionEvent::StateChanged {
            server_id: "fs".to_string(),
            previous: ConnectionState::Connecting,
            state: ConnectionState::connected(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["serverId"], "fs");
        assert_eq!(json["state"]["status"], "connected");
    }
}
