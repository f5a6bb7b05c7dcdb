//! Agent lifecycle management
//!
//! [`CloudAgent`] wires the components together and owns their background tasks.
//! Dependencies that touch the outside world (broker client, platform, record
//! delivery) are injected so tests can substitute mocks.

use super::router::InboundRouter;
use crate::auth::Authenticator;
use crate::commands::CommandDispatcher;
use crate::config::AgentConfig;
use crate::connection::{ConnectionState, ConnectionStateMachine};
use crate::diagnostics::{CrashReporter, HealthReporter};
use crate::error::{AgentError, AgentResult, ErrorSource};
use crate::events::{AgentEvent, EventBus};
use crate::platform::Platform;
use crate::queue::{
    EventRecord, HttpRecordSender, LogRecord, OutboundQueue, QueueForwarder, RecordSender,
    Severity,
};
use crate::supervisor::TaskSupervisor;
use crate::transport::{MessagingClient, MqttClient};
use crate::update::UpdateAgent;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

const INBOUND_CHANNEL_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The device-side cloud agent
pub struct CloudAgent {
    config: AgentConfig,
    device_id: String,
    platform: Arc<dyn Platform>,
    events: EventBus,
    queue: Arc<OutboundQueue>,
    authenticator: Arc<Authenticator>,
    messaging: Arc<dyn MessagingClient>,
    record_sender: Arc<dyn RecordSender>,
    connection: Arc<ConnectionStateMachine>,
    commands: Arc<CommandDispatcher>,
    updates: Option<Arc<UpdateAgent>>,
    health: Option<Arc<HealthReporter>>,
    supervisor: TaskSupervisor,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CloudAgent {
    /// Build with the MQTT client and HTTP record delivery
    pub fn new(config: AgentConfig, platform: Arc<dyn Platform>) -> AgentResult<Self> {
        let cloud = config.cloud.clone();
        let device_id = resolve_device_id(&config, platform.as_ref())?;
        let messaging: Arc<dyn MessagingClient> =
            Arc::new(MqttClient::new(&device_id, config.mqtt.clone()));

        Self::build(config, platform, messaging, move |authenticator| {
            let auth = cloud.use_authentication.then(|| authenticator.clone());
            let sender = HttpRecordSender::new(&cloud, auth)?;
            Ok(Arc::new(sender) as Arc<dyn RecordSender>)
        })
    }

    /// Build with injected broker client and record delivery
    pub fn with_components(
        config: AgentConfig,
        platform: Arc<dyn Platform>,
        messaging: Arc<dyn MessagingClient>,
        record_sender: Arc<dyn RecordSender>,
    ) -> AgentResult<Self> {
        Self::build(config, platform, messaging, move |_| Ok(record_sender))
    }

    fn build<F>(
        config: AgentConfig,
        platform: Arc<dyn Platform>,
        messaging: Arc<dyn MessagingClient>,
        make_sender: F,
    ) -> AgentResult<Self>
    where
        F: FnOnce(&Arc<Authenticator>) -> AgentResult<Arc<dyn RecordSender>>,
    {
        config.validate()?;
        let device_id = resolve_device_id(&config, platform.as_ref())?;
        let events = EventBus::new();
        let cancel = CancellationToken::new();
        let supervisor = TaskSupervisor::new(events.clone(), cancel.clone());

        let queue = Arc::new(OutboundQueue::new(config.queue.capacity));
        let authenticator = Arc::new(Authenticator::new(&config.cloud, platform.clone())?);
        let record_sender = make_sender(&authenticator)?;

        let crash = Arc::new(CrashReporter::new(
            &device_id,
            config.crash.paths.clone(),
            queue.clone(),
        ));
        let connection = Arc::new(
            ConnectionStateMachine::new(
                &config,
                &device_id,
                authenticator.clone(),
                messaging.clone(),
                platform.network_status(),
                events.clone(),
            )
            .with_crash_reporter(crash),
        );

        let updates = if config.update.enabled {
            Some(Arc::new(UpdateAgent::new(
                &config.update,
                &config.updates_dir(),
                platform.clone(),
                events.clone(),
                supervisor.clone(),
            )?))
        } else {
            None
        };

        let health = config.health.enabled.then(|| {
            Arc::new(HealthReporter::new(
                platform.clone(),
                queue.clone(),
                events.clone(),
                supervisor.clone(),
                config.health.interval(),
            ))
        });

        Ok(Self {
            config,
            device_id,
            platform,
            events,
            queue,
            authenticator,
            messaging,
            record_sender,
            connection,
            commands: Arc::new(CommandDispatcher::new()),
            updates,
            health,
            supervisor,
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    pub fn commands(&self) -> &Arc<CommandDispatcher> {
        &self.commands
    }

    pub fn connection(&self) -> &Arc<ConnectionStateMachine> {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// `None` when updates are disabled in configuration
    pub fn updates(&self) -> Option<&Arc<UpdateAgent>> {
        self.updates.as_ref()
    }

    pub fn add_subscription(&self, template: &str) {
        self.connection.add_subscription(template);
    }

    /// Queue a log record for the cloud
    pub fn log(&self, severity: Severity, message: impl Into<String>) -> AgentResult<u64> {
        let record = LogRecord::new(&self.device_id, severity, message);
        Ok(self.queue.enqueue_log(&record)?)
    }

    /// Queue a telemetry event for the cloud
    pub fn send_event(
        &self,
        event_id: u32,
        description: impl Into<String>,
        measurements: Value,
    ) -> AgentResult<u64> {
        let record = EventRecord::new(&self.device_id, event_id, description, measurements);
        Ok(self.queue.enqueue_event(&record)?)
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.supervisor.is_shutting_down()
    }

    /// Finish any interrupted update, then start every background task
    pub async fn start(&self) -> AgentResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AgentError::internal_error("agent already started"));
        }
        let span = crate::lifecycle_span!(device_id = %self.device_id);
        async {
            info!(version = env!("CARGO_PKG_VERSION"), "Starting cloud agent");

            if let Some(updates) = &self.updates {
                match updates.finalize_pending().await {
                    Ok(Some(applied)) => info!(update_id = %applied.id, "Finalized applied update"),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "Could not finalize pending update");
                        self.events.error(ErrorSource::Update, &e);
                    }
                }
            }

            let cancel = self.supervisor.cancellation_token();
            let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
            self.messaging.set_inbound_sender(inbound_tx);

            let router = InboundRouter::new(
                self.commands.clone(),
                self.updates.clone(),
                self.events.clone(),
            );
            let forwarder = QueueForwarder::new(
                self.queue.clone(),
                self.record_sender.clone(),
                self.connection.subscribe_state(),
                self.events.clone(),
                &self.config.queue,
            );

            let mut handles = vec![
                self.supervisor
                    .spawn("inbound_router", router.run(inbound_rx, cancel.clone())),
                self.supervisor
                    .spawn("queue_forwarder", forwarder.run(cancel.clone())),
                self.supervisor
                    .spawn("connection", self.connection.clone().run(cancel.clone())),
            ];

            if let Some(health) = &self.health {
                handles.push(self.supervisor.spawn(
                    "health_reporter",
                    health.clone().run(
                        self.connection.subscribe_state(),
                        self.platform.network_status(),
                        cancel.clone(),
                    ),
                ));
            }
            if let Some(updates) = &self.updates {
                handles.push(self.supervisor.spawn(
                    "update_agent",
                    updates
                        .clone()
                        .run(self.connection.subscribe_state(), cancel.clone()),
                ));
            }

            self.handles
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .extend(handles);
            info!("Cloud agent started");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Cancel every task and wait briefly for them to finish
    pub async fn shutdown(&self) {
        info!(device_id = %self.device_id, "Shutting down cloud agent");
        self.supervisor.shutdown();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Task shutdown error"),
                Err(_) => warn!("Task did not stop within the grace period"),
            }
        }
        if !self.supervisor.wait_tracked(SHUTDOWN_GRACE).await {
            warn!(
                in_flight = self.supervisor.in_flight(),
                "On-demand tasks still running after the grace period"
            );
        }
        info!("Cloud agent shutdown complete");
    }
}

fn resolve_device_id(config: &AgentConfig, platform: &dyn Platform) -> AgentResult<String> {
    Ok(config
        .configured_device_id()?
        .unwrap_or_else(|| platform.device_id().to_uppercase()))
}
