//! MQTT v5 messaging client
//!
//! Split the same way throughout: pure option building and topic handling in
//! [`connection`], pure event routing in [`message_handler`], and the I/O driving
//! the rumqttc event loop in [`client`].
//!
//! The client never reconnects on its own. When the link drops the event loop
//! stops polling and the connection state machine decides what happens next.

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{configure_mqtt_options, resolve_topic, MqttError};
pub use message_handler::{EventRoute, MessageHandler};
