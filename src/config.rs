//! Configuration system for the cloudlink agent
//!
//! Configuration is loaded from a TOML file. Every section has serde defaults so a
//! minimal file only needs the cloud endpoints.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default topics subscribed after every (re)connect
pub const DEFAULT_TOPICS: [&str; 2] = ["{OID}/commands/{ID}", "{OID}/ota/{ID}"];

/// Main agent configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub cloud: CloudSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub update: UpdateSection,
    #[serde(default)]
    pub crash: CrashSection,
    #[serde(default)]
    pub platform: PlatformSection,
}

/// Device identity and local storage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Explicit device identifier (takes precedence over `id_env`)
    pub id: Option<String>,
    /// Environment variable containing the device identifier
    pub id_env: Option<String>,
    /// Directory holding the update catalogue and downloaded packages
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            id: None,
            id_env: None,
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cloudlink")
}

/// Cloud HTTP endpoints and authentication policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudSection {
    /// Host serving `/api/devices/login`
    #[serde(default = "default_cloud_host")]
    pub auth_host: String,
    /// Host serving `/api/logs` and `/api/events`
    #[serde(default = "default_cloud_host")]
    pub data_host: String,
    #[serde(default = "default_true")]
    pub use_authentication: bool,
    /// Minutes a token stays valid before a fresh login is forced
    #[serde(default = "default_token_expiry_mins")]
    pub token_expiry_mins: u64,
    /// Fixed delay between authenticate/connect retries
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Organization used for `{OID}` when no token supplies one
    #[serde(default)]
    pub organization_id: Option<String>,
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            auth_host: default_cloud_host(),
            data_host: default_cloud_host(),
            use_authentication: true,
            token_expiry_mins: default_token_expiry_mins(),
            retry_delay_secs: default_retry_delay_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            organization_id: None,
        }
    }
}

impl CloudSection {
    pub fn token_expiry(&self) -> Duration {
        Duration::from_secs(self.token_expiry_mins * 60)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_cloud_host() -> String {
    "https://cloud.example.com".to_string()
}

fn default_true() -> bool {
    true
}

fn default_token_expiry_mins() -> u64 {
    60
}

fn default_retry_delay_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// MQTT broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://` or `mqtts://`
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Force TLS regardless of scheme and port
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// How long to wait for ConnAck/SubAck
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Topic templates, `{OID}` and `{ID}` are substituted at subscribe time
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            tls: false,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            topics: default_topics(),
        }
    }
}

impl MqttSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_broker_url() -> String {
    "mqtts://mqtt.cloud.example.com:8883".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_topics() -> Vec<String> {
    DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect()
}

/// Outbound record queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSection {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Forwarder wakes at least this often even without new records
    #[serde(default = "default_idle_period_secs")]
    pub idle_period_secs: u64,
    /// Pause between two delivery attempts
    #[serde(default = "default_throttle_delay_secs")]
    pub throttle_delay_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            idle_period_secs: default_idle_period_secs(),
            throttle_delay_secs: default_throttle_delay_secs(),
        }
    }
}

impl QueueSection {
    pub fn idle_period(&self) -> Duration {
        Duration::from_secs(self.idle_period_secs)
    }

    pub fn throttle_delay(&self) -> Duration {
        Duration::from_secs(self.throttle_delay_secs)
    }
}

fn default_queue_capacity() -> usize {
    30
}

fn default_idle_period_secs() -> u64 {
    30
}

fn default_throttle_delay_secs() -> u64 {
    5
}

/// Periodic health reporting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval_mins")]
    pub interval_mins: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_mins: default_health_interval_mins(),
        }
    }
}

impl HealthSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_mins * 60)
    }
}

fn default_health_interval_mins() -> u64 {
    15
}

/// What to do when a downloaded package does not match its advertised hash
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HashPolicy {
    /// Log a warning and keep the package
    #[default]
    Warn,
    /// Discard the package and report the update as failed
    Enforce,
}

/// OTA update settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_download_retries")]
    pub max_download_retries: u32,
    #[serde(default = "default_download_retry_delay_ms")]
    pub download_retry_delay_ms: u64,
    #[serde(default)]
    pub hash_policy: HashPolicy,
    /// Upper bound for the host's graceful shutdown before reset
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_download_retries: default_max_download_retries(),
            download_retry_delay_ms: default_download_retry_delay_ms(),
            hash_policy: HashPolicy::Warn,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl UpdateSection {
    pub fn download_retry_delay(&self) -> Duration {
        Duration::from_millis(self.download_retry_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_max_download_retries() -> u32 {
    10
}

fn default_download_retry_delay_ms() -> u64 {
    1000
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

/// Crash marker files written by the hosting runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrashSection {
    #[serde(default = "default_crash_paths")]
    pub paths: Vec<PathBuf>,
}

impl Default for CrashSection {
    fn default() -> Self {
        Self {
            paths: default_crash_paths(),
        }
    }
}

fn default_crash_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/var/lib/cloudlink/crash/app_crash.txt"),
        PathBuf::from("/var/lib/cloudlink/crash/runtime_crash.txt"),
        PathBuf::from("/var/lib/cloudlink/crash/boot_error.txt"),
    ]
}

/// Settings for the host platform implementation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformSection {
    /// PEM encoded device private key used to unwrap the session key
    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,
    /// Command executed to reset the device after staging an update
    #[serde(default = "default_reset_command")]
    pub reset_command: Vec<String>,
    /// File containing the coprocessor firmware version, if any
    pub coprocessor_version_path: Option<PathBuf>,
    /// sysfs capacity file for the battery, if any
    pub battery_capacity_path: Option<PathBuf>,
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            private_key_path: default_private_key_path(),
            reset_command: default_reset_command(),
            coprocessor_version_path: None,
            battery_capacity_path: None,
        }
    }
}

fn default_private_key_path() -> PathBuf {
    PathBuf::from("/etc/cloudlink/device_key.pem")
}

fn default_reset_command() -> Vec<String> {
    vec!["systemctl".to_string(), "reboot".to_string()]
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.device.id {
            validate_device_id(id)?;
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue.capacity must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.topics.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.topics must contain at least one topic".to_string(),
            ));
        }
        if self.health.enabled && self.health.interval_mins == 0 {
            return Err(ConfigError::InvalidConfig(
                "health.interval_mins must be greater than 0".to_string(),
            ));
        }
        url::Url::parse(&self.cloud.auth_host)
            .map_err(|e| ConfigError::InvalidConfig(format!("cloud.auth_host: {e}")))?;
        url::Url::parse(&self.cloud.data_host)
            .map_err(|e| ConfigError::InvalidConfig(format!("cloud.data_host: {e}")))?;
        Ok(())
    }

    /// Resolve the device identifier from the file or the configured environment variable
    ///
    /// Returns `Ok(None)` when neither is set so the platform can fall back to its own
    /// hardware identifier.
    pub fn configured_device_id(&self) -> Result<Option<String>, ConfigError> {
        if let Some(id) = &self.device.id {
            return Ok(Some(id.to_uppercase()));
        }
        match &self.device.id_env {
            Some(name) => {
                let id = std::env::var(name)
                    .map_err(|_| ConfigError::EnvVarNotFound(name.to_string()))?;
                validate_device_id(&id)?;
                Ok(Some(id.to_uppercase()))
            }
            None => Ok(None),
        }
    }

    /// Directory holding the update catalogue, packages and staging area
    pub fn updates_dir(&self) -> PathBuf {
        self.device.data_dir.join("updates")
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "abc123"
data_dir = "/tmp/cloudlink-test"

[cloud]
auth_host = "http://localhost:8080"
data_host = "http://localhost:8080"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Device identifiers are used verbatim in MQTT topics
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9_-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[device]
id = "f00dcafe"
data_dir = "/data/cloudlink"

[cloud]
auth_host = "https://auth.example.com"
data_host = "https://data.example.com"
use_authentication = false
token_expiry_mins = 30
retry_delay_secs = 3

[mqtt]
broker_url = "mqtt://broker.local:1883"
topics = ["{OID}/commands/{ID}"]

[queue]
capacity = 50

[update]
hash_policy = "enforce"
max_download_retries = 4

[crash]
paths = ["/tmp/crash.txt"]
"#;

        let config: AgentConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.device.id.as_deref(), Some("f00dcafe"));
        assert!(!config.cloud.use_authentication);
        assert_eq!(config.cloud.token_expiry(), Duration::from_secs(1800));
        assert_eq!(config.cloud.retry_delay(), Duration::from_secs(3));
        assert_eq!(config.mqtt.topics, vec!["{OID}/commands/{ID}"]);
        assert_eq!(config.queue.capacity, 50);
        assert_eq!(config.queue.throttle_delay(), Duration::from_secs(5));
        assert_eq!(config.update.hash_policy, HashPolicy::Enforce);
        assert_eq!(config.update.max_download_retries, 4);
        assert_eq!(config.crash.paths, vec![PathBuf::from("/tmp/crash.txt")]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: AgentConfig = toml::from_str("").unwrap();
        assert_eq!(config.queue.capacity, 30);
        assert_eq!(config.queue.idle_period(), Duration::from_secs(30));
        assert_eq!(config.update.max_download_retries, 10);
        assert_eq!(config.update.download_retry_delay(), Duration::from_secs(1));
        assert_eq!(config.update.hash_policy, HashPolicy::Warn);
        assert_eq!(config.update.shutdown_timeout(), Duration::from_secs(5));
        assert!(config.cloud.use_authentication);
        assert_eq!(config.mqtt.topics.len(), 2);
        assert_eq!(config.health.interval(), Duration::from_secs(900));
    }

    #[test]
    fn test_invalid_device_id() {
        assert!(validate_device_id("bad/id").is_err());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("Good-Device_01").is_ok());
    }

    #[test]
    fn test_configured_device_id_is_uppercased() {
        let config = AgentConfig::test_config();
        assert_eq!(
            config.configured_device_id().unwrap().as_deref(),
            Some("ABC123")
        );
    }

    #[test]
    fn test_missing_device_id_env_var() {
        let mut config = AgentConfig::test_config();
        config.device.id = None;
        config.device.id_env = Some("CLOUDLINK_TEST_SURELY_UNSET_VAR".to_string());
        assert!(matches!(
            config.configured_device_id(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = AgentConfig::test_config();
        config.queue.capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_updates_dir() {
        let config = AgentConfig::test_config();
        assert_eq!(
            config.updates_dir(),
            PathBuf::from("/tmp/cloudlink-test/updates")
        );
    }
}
