//! Connection states and the pure transition function

use serde::Serialize;
use std::fmt;

/// Lifecycle of the cloud connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Unknown,
    Disconnected,
    Authenticating,
    Connecting,
    Subscribing,
    Connected,
    Paused,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Connected => "connected",
            ConnectionState::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Inputs that move the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Started,
    CredentialsChecked { auth_required: bool, token_stale: bool },
    LoginSucceeded,
    LoginFailed,
    BrokerConnected,
    BrokerFailed,
    SubscriptionsComplete,
    SubscriptionFailed,
    LinkLost,
    NetworkDown,
}

/// Pure transition; events that don't apply to `current` leave it unchanged
pub fn next_state(current: ConnectionState, event: ConnectionEvent) -> ConnectionState {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (current, event) {
        (_, E::NetworkDown) => S::Disconnected,
        (S::Unknown, E::Started) => S::Disconnected,
        (
            S::Disconnected,
            E::CredentialsChecked {
                auth_required,
                token_stale,
            },
        ) => {
            if auth_required && token_stale {
                S::Authenticating
            } else {
                S::Connecting
            }
        }
        (S::Authenticating, E::LoginSucceeded) => S::Connecting,
        (S::Authenticating, E::LoginFailed) => S::Authenticating,
        (S::Connecting, E::BrokerConnected) => S::Subscribing,
        (S::Connecting, E::BrokerFailed) => S::Disconnected,
        (S::Subscribing, E::SubscriptionsComplete) => S::Connected,
        (S::Subscribing, E::SubscriptionFailed) => S::Disconnected,
        (S::Subscribing | S::Connected, E::LinkLost) => S::Disconnected,
        (state, _) => state,
    }
}
