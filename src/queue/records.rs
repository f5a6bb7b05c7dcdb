//! Wire shapes for the logs and events endpoints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Fatal,
}

/// Body posted to `/api/logs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub device_id: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(device_id: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            severity,
            message: message.into(),
            exception: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }
}

/// Body posted to `/api/events`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub device_id: String,
    pub event_id: u32,
    pub description: String,
    pub measurements: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(
        device_id: impl Into<String>,
        event_id: u32,
        description: impl Into<String>,
        measurements: Value,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            event_id,
            description: description.into(),
            measurements,
            timestamp: Utc::now(),
        }
    }
}
