//! Cloud connection lifecycle

pub mod machine;
pub mod state;

pub use machine::ConnectionStateMachine;
pub use state::{next_state, ConnectionEvent, ConnectionState};
