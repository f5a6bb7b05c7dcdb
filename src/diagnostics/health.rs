//! Periodic device health reports

use crate::connection::ConnectionState;
use crate::error::{AgentResult, ErrorSource};
use crate::events::EventBus;
use crate::platform::{Platform, PlatformError};
use crate::queue::{DeliveryError, EventRecord, OutboundQueue};
use crate::supervisor::TaskSupervisor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event id used for health records on the events endpoint
pub const HEALTH_EVENT_ID: u32 = 100;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Health snapshot unavailable: {0}")]
    Snapshot(#[from] PlatformError),
    #[error("Health record not queued: {0}")]
    Queue(#[from] DeliveryError),
}

/// Posts platform health snapshots through the outbound queue
pub struct HealthReporter {
    platform: Arc<dyn Platform>,
    queue: Arc<OutboundQueue>,
    events: EventBus,
    supervisor: TaskSupervisor,
    interval: Duration,
    /// Single slot; a send already in flight makes new ones drop out
    in_flight: Mutex<()>,
}

impl HealthReporter {
    pub fn new(
        platform: Arc<dyn Platform>,
        queue: Arc<OutboundQueue>,
        events: EventBus,
        supervisor: TaskSupervisor,
        interval: Duration,
    ) -> Self {
        Self {
            platform,
            queue,
            events,
            supervisor,
            interval,
            in_flight: Mutex::new(()),
        }
    }

    /// Take a snapshot and queue it
    ///
    /// Returns `Ok(false)` without doing anything when another send is in flight.
    pub async fn send_now(&self) -> Result<bool, HealthError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Health report already in flight, skipping tick");
            return Ok(false);
        };

        let snapshot = self.platform.health_snapshot().await?;
        let measurements = serde_json::to_value(&snapshot).map_err(DeliveryError::from)?;
        let record = EventRecord::new(
            self.platform.device_id(),
            HEALTH_EVENT_ID,
            "Device health",
            measurements,
        );
        let sequence = self.queue.enqueue_event(&record)?;
        debug!(sequence, "Health report queued");
        Ok(true)
    }

    /// Run a send on its own task so a slow snapshot never delays the timer
    fn spawn_send(self: &Arc<Self>) {
        let reporter = self.clone();
        self.supervisor.spawn_tracked("health_send", async move {
            if let Err(e) = reporter.send_now().await {
                warn!(error = %e, "Health report failed");
                reporter.events.error(ErrorSource::Health, &e);
            }
            Ok(())
        });
    }

    /// Wait for the network, then report on every interval and on every (re)connect
    pub async fn run(
        self: Arc<Self>,
        mut state: watch::Receiver<ConnectionState>,
        mut network: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> AgentResult<()> {
        while !*network.borrow_and_update() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = network.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        info!(interval_secs = self.interval.as_secs(), "Health reporter started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would race the first-connect report
        ticker.tick().await;

        let mut was_connected = *state.borrow_and_update() == ConnectionState::Connected;
        if was_connected {
            self.spawn_send();
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.spawn_send(),
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let connected = *state.borrow_and_update() == ConnectionState::Connected;
                    if connected && !was_connected {
                        self.spawn_send();
                    }
                    was_connected = connected;
                }
            }
        }

        info!("Health reporter stopped");
        Ok(())
    }
}
