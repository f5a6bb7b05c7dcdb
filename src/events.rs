//! Agent events and their fan-out
//!
//! Every observable state change is published on a broadcast channel. Each subscriber
//! owns its receiver, so a slow or failing subscriber only loses its own events.

use crate::connection::ConnectionState;
use crate::error::{ErrorEvent, ErrorSource};
use crate::update::UpdateMessage;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events exposed to the hosting application
#[derive(Debug, Clone)]
pub enum AgentEvent {
    ConnectionStateChanged(ConnectionState),
    ErrorOccurred(ErrorEvent),
    UpdateAvailable(UpdateMessage),
    UpdateProgress {
        id: String,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
    },
    UpdateRetrieved(UpdateMessage),
    UpdateApplied(UpdateMessage),
    /// Terminal failure for one update, so the host can report the failed rollout
    UpdateFailed { id: String, reason: String },
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::ConnectionStateChanged(_) => "connection_state_changed",
            AgentEvent::ErrorOccurred(_) => "error_occurred",
            AgentEvent::UpdateAvailable(_) => "update_available",
            AgentEvent::UpdateProgress { .. } => "update_progress",
            AgentEvent::UpdateRetrieved(_) => "update_retrieved",
            AgentEvent::UpdateApplied(_) => "update_applied",
            AgentEvent::UpdateFailed { .. } => "update_failed",
        }
    }
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentEvent::ConnectionStateChanged(state) => write!(f, "connection state {state}"),
            AgentEvent::ErrorOccurred(error) => write!(f, "error {error}"),
            AgentEvent::UpdateAvailable(msg) => write!(f, "update {} available", msg.id),
            AgentEvent::UpdateProgress {
                id,
                downloaded_bytes,
                ..
            } => write!(f, "update {id} downloaded {downloaded_bytes} bytes"),
            AgentEvent::UpdateRetrieved(msg) => write!(f, "update {} retrieved", msg.id),
            AgentEvent::UpdateApplied(msg) => write!(f, "update {} applied", msg.id),
            AgentEvent::UpdateFailed { id, reason } => write!(f, "update {id} failed: {reason}"),
        }
    }
}

/// Cloneable publisher for [`AgentEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Register a new observer; it receives events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: AgentEvent) {
        // No receivers is a normal condition while the host has not subscribed yet
        if self.sender.send(event).is_err() {
            debug!("Event emitted with no subscribers");
        }
    }

    /// Shorthand for raising an `ErrorOccurred` event
    pub fn error(&self, source: ErrorSource, error: impl fmt::Display) {
        self.emit(AgentEvent::ErrorOccurred(ErrorEvent::new(source, error)));
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(AgentEvent::ConnectionStateChanged(ConnectionState::Connected));

        assert!(matches!(
            first.recv().await.unwrap(),
            AgentEvent::ConnectionStateChanged(ConnectionState::Connected)
        ));
        assert!(matches!(
            second.recv().await.unwrap(),
            AgentEvent::ConnectionStateChanged(ConnectionState::Connected)
        ));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let dropped = bus.subscribe();
        let mut alive = bus.subscribe();
        drop(dropped);

        bus.error(ErrorSource::Queue, "boom");

        match alive.recv().await.unwrap() {
            AgentEvent::ErrorOccurred(event) => {
                assert_eq!(event.source, ErrorSource::Queue);
                assert_eq!(event.message, "boom");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.emit(AgentEvent::UpdateFailed {
            id: "u1".to_string(),
            reason: "nope".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_names() {
        let event = AgentEvent::UpdateProgress {
            id: "u1".to_string(),
            downloaded_bytes: 10,
            total_bytes: None,
        };
        assert_eq!(event.name(), "update_progress");
        assert_eq!(event.to_string(), "update u1 downloaded 10 bytes");
    }
}
