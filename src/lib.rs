//! cloudlink - device-side cloud connectivity agent
//!
//! Connects an embedded device to its cloud backend: authenticates against the
//! login endpoint, keeps an MQTT session alive through a reconnecting state
//! machine, forwards logs and telemetry through a bounded queue, dispatches
//! inbound commands and runs resumable over-the-air updates.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cloudlink::{AgentConfig, CloudAgent};
//! use cloudlink::platform::{HostPlatform, HostShutdown};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig::load_from_file("cloudlink.toml".as_ref())?;
//! let platform = Arc::new(HostPlatform::new(&config, HostShutdown::new())?);
//! let agent = CloudAgent::new(config, platform)?;
//!
//! agent.commands().subscribe::<serde_json::Value, _>("Reboot", |_args| {
//!     // schedule a reboot
//! });
//! agent.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod auth;
pub mod commands;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod observability;
pub mod platform;
pub mod queue;
pub mod supervisor;
pub mod testing;
pub mod transport;
pub mod update;

pub use agent::CloudAgent;
pub use config::*;
pub use connection::{ConnectionState, ConnectionStateMachine};
pub use error::{AgentError, AgentResult, ErrorEvent, ErrorSource};
pub use events::{AgentEvent, EventBus};
pub use transport::mqtt::MqttClient;
pub use update::{UpdateAgent, UpdateMessage, UpdateState};
