//! Error types for the cloudlink agent
//!
//! Each subsystem owns a `thiserror` enum; `AgentError` unifies them for callers that
//! drive several subsystems. Errors that leave the process through the event channel
//! are converted into [`ErrorEvent`]s, which carry a sanitized message.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] crate::auth::AuthError),

    #[error("Transport error: {0}")]
    Mqtt(#[from] crate::transport::mqtt::MqttError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] crate::queue::DeliveryError),

    #[error("Command error: {0}")]
    Command(#[from] crate::commands::CommandError),

    #[error("Update error: {0}")]
    Update(#[from] crate::update::UpdateError),

    #[error("Platform error: {0}")]
    Platform(#[from] crate::platform::PlatformError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AgentError {
    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Subsystem the error originated from
    pub fn source_kind(&self) -> ErrorSource {
        match self {
            AgentError::Config(_) => ErrorSource::Configuration,
            AgentError::Auth(e) if e.is_crypto_failure() => ErrorSource::System,
            AgentError::Auth(_) => ErrorSource::Authentication,
            AgentError::Mqtt(_) => ErrorSource::Messaging,
            AgentError::Delivery(_) => ErrorSource::Queue,
            AgentError::Command(_) => ErrorSource::Command,
            AgentError::Update(_) => ErrorSource::Update,
            AgentError::Platform(_) => ErrorSource::System,
            AgentError::Internal { .. } => ErrorSource::Supervisor,
        }
    }

    /// Convert into an event suitable for the error channel
    pub fn to_error_event(&self) -> ErrorEvent {
        ErrorEvent::new(self.source_kind(), self)
    }
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Where an error was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Configuration,
    Connection,
    Authentication,
    Messaging,
    Queue,
    Command,
    Update,
    Health,
    /// Platform and crypto failures that need the reliability collaborator's attention
    System,
    /// A background task ended with an error or panicked
    Supervisor,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorSource::Configuration => "configuration",
            ErrorSource::Connection => "connection",
            ErrorSource::Authentication => "authentication",
            ErrorSource::Messaging => "messaging",
            ErrorSource::Queue => "queue",
            ErrorSource::Command => "command",
            ErrorSource::Update => "update",
            ErrorSource::Health => "health",
            ErrorSource::System => "system",
            ErrorSource::Supervisor => "supervisor",
        };
        f.write_str(name)
    }
}

/// Error payload published on the event channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub source: ErrorSource,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(source: ErrorSource, error: impl fmt::Display) -> Self {
        Self {
            source,
            message: sanitize_error_message(&error.to_string()),
        }
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.source, self.message)
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static BEARER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bbearer\s+\S+").expect("bearer pattern is valid"));

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|keys?)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

/// Redact credentials and key paths, and cap the length of messages leaving the process
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = BEARER_PATTERN
        .replace_all(&sanitized, "Bearer ***")
        .to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
