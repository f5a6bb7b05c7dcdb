//! Testing utilities and mock implementations
//!
//! Mocks for the broker client, the device platform and record delivery, so the
//! agent can be exercised without a broker, hardware or cloud endpoints.

pub mod mocks;

pub use mocks::*;
