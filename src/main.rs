//! cloudlink agent - Main Entry Point

use clap::{Parser, Subcommand};
use cloudlink::config::AgentConfig;
use cloudlink::observability::init_default_logging;
use cloudlink::platform::{HostPlatform, HostShutdown, Platform};
use cloudlink::update::UpdateStore;
use cloudlink::{AgentEvent, CloudAgent, UpdateAgent};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["cloudlink.toml", "/etc/cloudlink/cloudlink.toml"];
/// How long the reset may take once the host has been asked to stop
const RESET_WAIT: Duration = Duration::from_secs(30);

/// Device cloud connectivity and OTA update agent
#[derive(Parser)]
#[command(name = "cloudlink")]
#[command(about = "Device cloud connectivity and OTA update agent")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CLOUDLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until SIGINT/SIGTERM
    Run {
        /// Download announced updates and apply them as soon as they are retrieved
        #[arg(long)]
        auto_update: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Inspect or reset the local update catalogue
    Updates {
        #[command(subcommand)]
        action: UpdatesAction,
    },
}

#[derive(Subcommand)]
enum UpdatesAction {
    /// List known updates
    List,
    /// Forget all updates and delete downloaded packages
    Clear,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { auto_update } => run_agent(config, auto_update).await,
        Commands::Config { show } => handle_config_command(config, show),
        Commands::Updates { action } => handle_updates_command(config, action),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AgentConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AgentConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create cloudlink.toml".into())
}

async fn run_agent(config: AgentConfig, auto_update: bool) -> Result<(), Box<dyn std::error::Error>> {
    let host_shutdown = HostShutdown::new();
    let host = Arc::new(HostPlatform::new(&config, host_shutdown.clone())?);
    info!(device_id = %host.device_id(), "Starting cloudlink agent");

    let monitor_cancel = CancellationToken::new();
    let monitor = {
        let host = host.clone();
        let cancel = monitor_cancel.clone();
        tokio::spawn(async move { host.monitor_network(cancel).await })
    };

    let platform: Arc<dyn Platform> = host;
    let agent = CloudAgent::new(config, platform)?;
    let auto_updater = match (auto_update, agent.updates()) {
        (true, Some(updates)) => Some(spawn_auto_updater(&agent, updates.clone())),
        (true, None) => {
            warn!("--auto-update ignored because updates are disabled");
            None
        }
        _ => None,
    };

    agent.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Agent running");
    let resetting = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            false
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            false
        }
        _ = host_shutdown.requested() => {
            info!("Update requested shutdown, stopping before reset");
            true
        }
    };

    agent.shutdown().await;
    monitor_cancel.cancel();
    if let Err(e) = monitor.await {
        warn!("Network monitor ended abnormally: {}", e);
    }
    // Releases the update task waiting to reset the device
    host_shutdown.complete();

    if let Some(handle) = auto_updater {
        if resetting {
            // The apply task is the one driving the reset
            if tokio::time::timeout(RESET_WAIT, handle).await.is_err() {
                warn!("Device reset did not happen within {:?}", RESET_WAIT);
            }
        } else {
            handle.abort();
        }
    }

    info!("Application shutdown complete");
    Ok(())
}

/// Retrieve every announced update and apply it once downloaded
fn spawn_auto_updater(agent: &CloudAgent, updates: Arc<UpdateAgent>) -> JoinHandle<()> {
    let mut events = agent.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AgentEvent::UpdateAvailable(update)) => {
                    if let Err(e) = updates.retrieve_update(&update.id) {
                        warn!(update_id = %update.id, error = %e, "Could not start download");
                    }
                }
                Ok(AgentEvent::UpdateRetrieved(update)) if !update.applied => {
                    if let Err(e) = updates.apply_update(&update.id).await {
                        error!(update_id = %update.id, error = %e, "Update apply failed");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Auto-updater missed events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn handle_config_command(config: AgentConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

fn handle_updates_command(
    config: AgentConfig,
    action: UpdatesAction,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = UpdateStore::open(&config.updates_dir())?;
    match action {
        UpdatesAction::List => {
            if store.is_empty() {
                println!("No updates known");
            }
            for update in store.all() {
                println!(
                    "{}  os={}  progress={}B  retrieved={}  applied={}",
                    update.id,
                    update.os_version,
                    update.download_progress,
                    update.retrieved,
                    update.applied
                );
            }
        }
        UpdatesAction::Clear => {
            let removed = store.clear()?;
            println!("Removed {removed} update(s)");
        }
    }
    Ok(())
}
