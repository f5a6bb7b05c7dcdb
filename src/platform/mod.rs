//! Platform capabilities injected into the agent
//!
//! The agent never talks to hardware directly. Device identity, crypto primitives,
//! metrics, network status and the reset line all come through [`Platform`], which
//! the host supplies at construction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

pub mod crypto;
pub mod host;

pub use crypto::SoftwareCrypto;
pub use host::{HostPlatform, HostShutdown};

/// Platform capability errors
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Crypto operation failed: {0}")]
    Crypto(String),
    #[error("Device key unavailable: {0}")]
    KeyUnavailable(String),
    #[error("Metrics unavailable: {0}")]
    Metrics(String),
    #[error("Device reset failed: {0}")]
    Reset(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Point-in-time device health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_temperature_celsius: Option<f32>,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub os_version: String,
    pub coprocessor_version: Option<String>,
    pub battery_percent: Option<u8>,
    pub uptime_secs: u64,
}

/// Capabilities the hosting device provides
#[async_trait]
pub trait Platform: Send + Sync {
    /// Unique device identifier, already upper-cased
    fn device_id(&self) -> String;

    /// Version tag of the running operating system image
    fn os_version(&self) -> String;

    fn coprocessor_version(&self) -> Option<String>;

    /// Decrypt with the device private key
    fn rsa_decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PlatformError>;

    /// AES-CBC decrypt without unpadding; callers strip padding artifacts themselves
    fn aes_cbc_decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, PlatformError>;

    async fn health_snapshot(&self) -> Result<HealthSnapshot, PlatformError>;

    /// `true` while any network adapter reports connected
    fn network_status(&self) -> watch::Receiver<bool>;

    /// Ask the hosting application to stop gracefully; callers bound the wait
    async fn request_shutdown(&self);

    /// Reboot the device; on real hardware this does not return
    async fn reset_device(&self) -> Result<(), PlatformError>;
}
