//! Agent composition
//!
//! [`CloudAgent`] builds every component from configuration and runs their
//! background tasks; [`InboundRouter`] feeds broker messages to the command
//! dispatcher and the update agent.

pub mod lifecycle;
pub mod router;

pub use lifecycle::*;
pub use router::*;
