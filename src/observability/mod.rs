//! Observability for the device agent
//!
//! Structured logging only; runtime events for the host go through
//! [`crate::events::EventBus`].

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{connection_span, lifecycle_span, update_span};
