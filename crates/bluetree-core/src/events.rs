//! Event system for discovery, connection, and resolution notifications.
//!
//! Each component owns an [`EventDispatcher`] and emits [`CoreEvent`]s
//! through it; callers subscribe and react. Events are serializable for
//! logging and IPC.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use bluetree_types::{PeripheralInfo, ServiceState};

use crate::error::ErrorKind;

/// Events emitted by the bluetree core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum CoreEvent {
    /// A qualifying peripheral was observed for the first time this scan.
    DeviceDiscovered {
        /// The discovered peripheral.
        device: PeripheralInfo,
    },
    /// The scan cycle ended.
    DiscoveryFinished,
    /// A connection to the peripheral was opened.
    Connected {
        /// Address of the connected peripheral.
        address: String,
    },
    /// The connection to the peripheral was closed.
    Disconnected {
        /// Address of the disconnected peripheral.
        address: String,
    },
    /// One GATT service was found during resolution.
    ServiceDiscovered {
        /// Identifier of the service.
        uuid: Uuid,
    },
    /// A service session's resolution state advanced.
    StateChanged {
        /// Identifier of the service the session resolves.
        uuid: Uuid,
        /// The new state.
        state: ServiceState,
    },
    /// An operation failed.
    Error {
        /// Classification of the failure.
        kind: ErrorKind,
    },
}

/// Sender for core events.
pub type EventSender = broadcast::Sender<CoreEvent>;

/// Receiver for core events.
pub type EventReceiver = broadcast::Receiver<CoreEvent>;

/// Event dispatcher fanning events out to every subscriber.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new dispatcher with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: CoreEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let dispatcher = EventDispatcher::default();
        let mut rx = dispatcher.subscribe();

        dispatcher.send(CoreEvent::DiscoveryFinished);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, CoreEvent::DiscoveryFinished));
    }

    #[test]
    fn send_without_subscribers_is_fine() {
        let dispatcher = EventDispatcher::new(4);
        dispatcher.send(CoreEvent::DiscoveryFinished);
        assert_eq!(dispatcher.receiver_count(), 0);
    }

    #[test]
    fn events_serialize_tagged() {
        let event = CoreEvent::Connected {
            address: "AA:BB:CC:DD:EE:FF".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"connected\""));
        assert!(json.contains("AA:BB:CC:DD:EE:FF"));
    }
}
