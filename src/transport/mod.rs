//! Pub/sub transport between the device and the cloud broker
//!
//! [`MessagingClient`] is the seam the connection state machine drives. The MQTT v5
//! implementation lives in [`mqtt`]; tests substitute `testing::MockMessagingClient`.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

pub mod mqtt;

pub use mqtt::{MqttClient, MqttError};

/// Username/password presented to the broker
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A message delivered by the broker on one of our subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// MQTT v5 user properties, in arrival order
    pub user_properties: Vec<(String, String)>,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            user_properties: Vec::new(),
            retain: false,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    /// First user property whose key matches case-insensitively
    pub fn property(&self, key: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Broker connection as seen by the connection state machine
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Connect and wait for the broker's acknowledgement
    async fn connect(&self, credentials: Option<BrokerCredentials>) -> Result<(), MqttError>;

    async fn disconnect(&self) -> Result<(), MqttError>;

    /// Subscribe and wait for the broker to confirm the grant
    async fn subscribe(&self, topic: &str) -> Result<(), MqttError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError>;

    fn is_connected(&self) -> bool;

    /// Flips to `false` when the broker link drops
    fn link_status(&self) -> watch::Receiver<bool>;

    /// Where received messages are forwarded; replaces any previous sender
    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>);
}
