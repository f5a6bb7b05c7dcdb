//! Drains the outbound queue while the connection is up

use super::{OutboundQueue, RecordSender};
use crate::config::QueueSection;
use crate::connection::ConnectionState;
use crate::error::{AgentResult, ErrorSource};
use crate::events::EventBus;
use crate::supervisor::cancellable_sleep;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Single consumer of [`OutboundQueue`]
///
/// Delivery is strictly head-first with one request in flight. A failed delivery
/// leaves the head in place and ends the pass; nothing is skipped.
///
/// Consecutive attempts are at least `throttle_delay` apart, whether the previous
/// one succeeded or failed and whether it happened in this pass or the last.
pub struct QueueForwarder {
    queue: Arc<OutboundQueue>,
    sender: Arc<dyn RecordSender>,
    state: watch::Receiver<ConnectionState>,
    events: EventBus,
    idle_period: Duration,
    throttle_delay: Duration,
    last_attempt: Mutex<Option<Instant>>,
}

impl QueueForwarder {
    pub fn new(
        queue: Arc<OutboundQueue>,
        sender: Arc<dyn RecordSender>,
        state: watch::Receiver<ConnectionState>,
        events: EventBus,
        config: &QueueSection,
    ) -> Self {
        Self {
            queue,
            sender,
            state,
            events,
            idle_period: config.idle_period(),
            throttle_delay: config.throttle_delay(),
            last_attempt: Mutex::new(None),
        }
    }

    /// Wake on enqueue, on a connection state change or after the idle period
    pub async fn run(mut self, cancel: CancellationToken) -> AgentResult<()> {
        info!("Outbound queue forwarder started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.queue.notified() => {}
                changed = self.state.changed() => {
                    if changed.is_err() {
                        debug!("Connection state channel closed, stopping forwarder");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.idle_period) => {}
            }

            self.drain(&cancel).await;
        }
        info!("Outbound queue forwarder stopped");
        Ok(())
    }

    fn connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    /// Wait off whatever is left of the throttle delay since the last attempt
    async fn pace(&self, cancel: &CancellationToken) -> bool {
        let remaining = self
            .last_attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|at| self.throttle_delay.saturating_sub(at.elapsed()));

        match remaining {
            Some(wait) if !wait.is_zero() => cancellable_sleep(cancel, wait).await,
            _ => true,
        }
    }

    fn mark_attempt(&self) {
        *self
            .last_attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
    }

    /// One delivery pass; returns how many records were delivered
    pub async fn drain(&self, cancel: &CancellationToken) -> usize {
        let mut delivered = 0;
        while self.connected() && !cancel.is_cancelled() {
            if self.queue.is_empty() || !self.pace(cancel).await {
                break;
            }
            // The link may have dropped while throttled
            if !self.connected() {
                break;
            }
            let Some(head) = self.queue.peek() else {
                break;
            };

            self.mark_attempt();
            match self.sender.send(&head).await {
                Ok(()) => {
                    self.queue.acknowledge(head.sequence);
                    delivered += 1;
                }
                Err(e) => {
                    warn!(sequence = head.sequence, error = %e, "Record delivery failed, will retry");
                    self.events.error(ErrorSource::Queue, &e);
                    break;
                }
            }
        }

        if delivered > 0 {
            debug!(delivered, remaining = self.queue.len(), "Delivery pass finished");
        }
        delivered
    }
}
