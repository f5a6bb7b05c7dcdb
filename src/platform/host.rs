//! Linux host implementation of [`Platform`]

use super::{HealthSnapshot, Platform, PlatformError, SoftwareCrypto};
use crate::config::AgentConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Components, Disks, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NETWORK_POLL_INTERVAL: Duration = Duration::from_secs(5);
const SYS_CLASS_NET: &str = "/sys/class/net";

/// Handshake between the platform and the application hosting the agent
///
/// The platform raises `requested`; the host stops the agent and then calls
/// [`HostShutdown::complete`], which releases the waiting `request_shutdown`.
#[derive(Debug, Clone, Default)]
pub struct HostShutdown {
    requested: CancellationToken,
    completed: CancellationToken,
}

impl HostShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves once a graceful stop has been requested
    pub async fn requested(&self) {
        self.requested.cancelled().await
    }

    pub fn is_requested(&self) -> bool {
        self.requested.is_cancelled()
    }

    /// Signal that the host finished stopping
    pub fn complete(&self) {
        self.completed.cancel();
    }

    async fn request_and_wait(&self) {
        self.requested.cancel();
        self.completed.cancelled().await
    }
}

/// Platform backed by the running Linux system
pub struct HostPlatform {
    device_id: String,
    crypto: SoftwareCrypto,
    reset_command: Vec<String>,
    coprocessor_version_path: Option<PathBuf>,
    battery_capacity_path: Option<PathBuf>,
    network_tx: watch::Sender<bool>,
    network_rx: watch::Receiver<bool>,
    host_shutdown: HostShutdown,
}

impl HostPlatform {
    /// Build from configuration; `host_shutdown` carries graceful stop requests to the host
    pub fn new(config: &AgentConfig, host_shutdown: HostShutdown) -> Result<Self, PlatformError> {
        let device_id = match config
            .configured_device_id()
            .map_err(|e| PlatformError::KeyUnavailable(e.to_string()))?
        {
            Some(id) => id,
            None => read_machine_id()?,
        };

        let crypto = match SoftwareCrypto::from_pem_file(&config.platform.private_key_path) {
            Ok(crypto) => crypto,
            Err(e) => {
                warn!(error = %e, "Device key not loaded, authentication will fail");
                SoftwareCrypto::without_key()
            }
        };

        let (network_tx, network_rx) = watch::channel(any_interface_up(Path::new(SYS_CLASS_NET)));

        Ok(Self {
            device_id,
            crypto,
            reset_command: config.platform.reset_command.clone(),
            coprocessor_version_path: config.platform.coprocessor_version_path.clone(),
            battery_capacity_path: config.platform.battery_capacity_path.clone(),
            network_tx,
            network_rx,
            host_shutdown,
        })
    }

    /// Poll interface operstate and publish changes until `cancel` fires
    pub async fn monitor_network(&self, cancel: CancellationToken) {
        loop {
            let up = any_interface_up(Path::new(SYS_CLASS_NET));
            self.network_tx.send_if_modified(|current| {
                if *current != up {
                    info!(network_up = up, "Network adapter state changed");
                    *current = up;
                    true
                } else {
                    false
                }
            });

            if !crate::supervisor::cancellable_sleep(&cancel, NETWORK_POLL_INTERVAL).await {
                break;
            }
        }
    }
}

fn read_machine_id() -> Result<String, PlatformError> {
    let raw = std::fs::read_to_string("/etc/machine-id")?;
    Ok(raw.trim().to_uppercase())
}

/// Any non-loopback interface whose operstate is `up`
fn any_interface_up(sys_class_net: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(sys_class_net) else {
        return false;
    };
    entries.flatten().any(|entry| {
        if entry.file_name() == "lo" {
            return false;
        }
        std::fs::read_to_string(entry.path().join("operstate"))
            .map(|state| state.trim() == "up")
            .unwrap_or(false)
    })
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl Platform for HostPlatform {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn os_version(&self) -> String {
        System::os_version().unwrap_or_else(|| "unknown".to_string())
    }

    fn coprocessor_version(&self) -> Option<String> {
        self.coprocessor_version_path
            .as_deref()
            .and_then(read_trimmed)
    }

    fn rsa_decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PlatformError> {
        self.crypto.rsa_decrypt(ciphertext)
    }

    fn aes_cbc_decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, PlatformError> {
        self.crypto.aes_cbc_decrypt(key, iv, ciphertext)
    }

    async fn health_snapshot(&self) -> Result<HealthSnapshot, PlatformError> {
        let os_version = self.os_version();
        let coprocessor_version = self.coprocessor_version();
        let battery_percent = self
            .battery_capacity_path
            .as_deref()
            .and_then(read_trimmed)
            .and_then(|s| s.parse::<u8>().ok());

        let (memory_used, memory_total, disk_used, disk_total, cpu_temperature) =
            tokio::task::spawn_blocking(|| {
                let mut sys = System::new();
                sys.refresh_memory();

                let disks = Disks::new_with_refreshed_list();
                let (disk_total, disk_available) =
                    disks.list().iter().fold((0u64, 0u64), |(total, avail), disk| {
                        (total + disk.total_space(), avail + disk.available_space())
                    });

                let components = Components::new_with_refreshed_list();
                let cpu_temperature = components
                    .list()
                    .iter()
                    .find(|c| {
                        let label = c.label().to_lowercase();
                        label.contains("cpu") || label.contains("package") || label.contains("soc")
                    })
                    .map(|c| c.temperature());

                (
                    sys.used_memory(),
                    sys.total_memory(),
                    disk_total.saturating_sub(disk_available),
                    disk_total,
                    cpu_temperature,
                )
            })
            .await
            .map_err(|e| PlatformError::Metrics(format!("metrics task failed: {e}")))?;

        Ok(HealthSnapshot {
            timestamp: chrono::Utc::now(),
            cpu_temperature_celsius: cpu_temperature,
            memory_used_bytes: memory_used,
            memory_total_bytes: memory_total,
            disk_used_bytes: disk_used,
            disk_total_bytes: disk_total,
            os_version,
            coprocessor_version,
            battery_percent,
            uptime_secs: System::uptime(),
        })
    }

    fn network_status(&self) -> watch::Receiver<bool> {
        self.network_rx.clone()
    }

    async fn request_shutdown(&self) {
        info!("Requesting graceful host shutdown");
        self.host_shutdown.request_and_wait().await;
        debug!("Host shutdown complete");
    }

    async fn reset_device(&self) -> Result<(), PlatformError> {
        let Some((program, args)) = self.reset_command.split_first() else {
            return Err(PlatformError::Reset("no reset command configured".to_string()));
        };

        info!(command = %program, "Resetting device");
        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await?;

        if status.success() {
            debug!("Reset command accepted");
            Ok(())
        } else {
            Err(PlatformError::Reset(format!("reset command exited with {status}")))
        }
    }
}
