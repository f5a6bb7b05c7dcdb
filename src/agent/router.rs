//! Inbound message routing
//!
//! Topics follow `{OID}/<kind>/{ID}`; the kind segment picks the consumer.

use crate::commands::CommandDispatcher;
use crate::error::{AgentResult, ErrorSource};
use crate::events::EventBus;
use crate::transport::InboundMessage;
use crate::update::UpdateAgent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consumer an inbound topic belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Command,
    UpdateNotice,
    Other,
}

/// Classify by the segment before the device id
pub fn classify_topic(topic: &str) -> TopicKind {
    let mut segments = topic.rsplit('/');
    let _device = segments.next();
    match segments.next() {
        Some(kind) if kind.eq_ignore_ascii_case("commands") => TopicKind::Command,
        Some(kind) if kind.eq_ignore_ascii_case("ota") => TopicKind::UpdateNotice,
        _ => TopicKind::Other,
    }
}

/// Hands each inbound message to the command dispatcher or the update agent
pub struct InboundRouter {
    commands: Arc<CommandDispatcher>,
    updates: Option<Arc<UpdateAgent>>,
    events: EventBus,
}

impl InboundRouter {
    pub fn new(
        commands: Arc<CommandDispatcher>,
        updates: Option<Arc<UpdateAgent>>,
        events: EventBus,
    ) -> Self {
        Self {
            commands,
            updates,
            events,
        }
    }

    /// Deliver one message; failures become `ErrorOccurred` events
    pub fn route(&self, message: &InboundMessage) -> TopicKind {
        let kind = classify_topic(&message.topic);
        match kind {
            TopicKind::Command => match self.commands.dispatch(message) {
                Ok(outcome) => {
                    debug!(topic = %message.topic, ?outcome, "Command dispatched");
                }
                Err(e) => self.events.error(ErrorSource::Command, &e),
            },
            TopicKind::UpdateNotice => match &self.updates {
                Some(updates) => {
                    if let Err(e) = updates.handle_notice(&message.payload) {
                        warn!(topic = %message.topic, error = %e, "Update notice rejected");
                        self.events.error(ErrorSource::Update, &e);
                    }
                }
                None => debug!(topic = %message.topic, "Updates disabled, notice ignored"),
            },
            TopicKind::Other => {
                debug!(topic = %message.topic, "No consumer for topic");
            }
        }
        kind
    }

    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        cancel: CancellationToken,
    ) -> AgentResult<()> {
        info!("Inbound router started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => {
                        self.route(&message);
                    }
                    None => break,
                },
            }
        }
        info!("Inbound router stopped");
        Ok(())
    }
}
