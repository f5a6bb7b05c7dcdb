//! Diagnostic producers feeding the outbound queue

pub mod crash;
pub mod health;

pub use crash::CrashReporter;
pub use health::{HealthError, HealthReporter};
