//! The connection lifecycle loop
//!
//! One task walks the states sequentially. Login and broker connect block it while
//! they run; nothing else waits on its progress. Other tasks only read the state,
//! apart from two writers: a network-down signal forcing `Disconnected`, and
//! [`ConnectionStateMachine::add_subscription`].

use super::state::{next_state, ConnectionEvent, ConnectionState};
use crate::auth::Authenticator;
use crate::config::AgentConfig;
use crate::diagnostics::CrashReporter;
use crate::error::{AgentError, AgentResult, ErrorSource};
use crate::events::{AgentEvent, EventBus};
use crate::supervisor::cancellable_sleep;
use crate::transport::mqtt::resolve_topic;
use crate::transport::{BrokerCredentials, MessagingClient};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const NETWORK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Drives authenticate → connect → subscribe and keeps the link alive
pub struct ConnectionStateMachine {
    device_id: String,
    auth_required: bool,
    fallback_organization: Option<String>,
    retry_delay: Duration,
    authenticator: Arc<Authenticator>,
    messaging: Arc<dyn MessagingClient>,
    network: watch::Receiver<bool>,
    state_tx: watch::Sender<ConnectionState>,
    events: EventBus,
    crash_reporter: Option<Arc<CrashReporter>>,
    topic_templates: Mutex<Vec<String>>,
    /// Resolved topics granted on the current broker session
    subscribed: Mutex<HashSet<String>>,
    ever_connected: AtomicBool,
}

impl ConnectionStateMachine {
    pub fn new(
        config: &AgentConfig,
        device_id: &str,
        authenticator: Arc<Authenticator>,
        messaging: Arc<dyn MessagingClient>,
        network: watch::Receiver<bool>,
        events: EventBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Unknown);
        Self {
            device_id: device_id.to_uppercase(),
            auth_required: config.cloud.use_authentication,
            fallback_organization: config.cloud.organization_id.clone(),
            retry_delay: config.cloud.retry_delay(),
            authenticator,
            messaging,
            network,
            state_tx,
            events,
            crash_reporter: None,
            topic_templates: Mutex::new(config.mqtt.topics.clone()),
            subscribed: Mutex::new(HashSet::new()),
            ever_connected: AtomicBool::new(false),
        }
    }

    /// Crash reports are flushed on the first `Connected` of the process
    pub fn with_crash_reporter(mut self, reporter: Arc<CrashReporter>) -> Self {
        self.crash_reporter = Some(reporter);
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn topic_templates(&self) -> Vec<String> {
        self.topic_templates
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self
            .subscribed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// Apply `event` atomically against whatever the state is right now
    fn apply(&self, event: ConnectionEvent) -> ConnectionState {
        let mut changed = None;
        self.state_tx.send_if_modified(|state| {
            let next = next_state(*state, event);
            if next != *state {
                changed = Some((*state, next));
                *state = next;
                true
            } else {
                false
            }
        });

        match changed {
            Some((from, to)) => {
                self.announce(from, to);
                to
            }
            None => self.state(),
        }
    }

    /// Unconditional write, for the pause/resume sequence
    fn force(&self, to: ConnectionState) {
        let from = self.state_tx.send_replace(to);
        if from != to {
            self.announce(from, to);
        }
    }

    fn announce(&self, from: ConnectionState, to: ConnectionState) {
        info!(from = %from, to = %to, "Connection state changed");
        self.events.emit(AgentEvent::ConnectionStateChanged(to));
    }

    fn raise(&self, error: AgentError) {
        self.events
            .emit(AgentEvent::ErrorOccurred(error.to_error_event()));
    }

    /// Add a topic template to the subscription set
    ///
    /// Pauses the machine while the set changes. A `Connected` machine resumes in
    /// `Subscribing` so the loop subscribes the new topic; any other state is
    /// restored as it was.
    pub fn add_subscription(&self, template: &str) {
        let prior = self.state();
        self.force(ConnectionState::Paused);

        {
            let mut templates = self.topic_templates.lock().unwrap_or_else(|p| p.into_inner());
            if !templates.iter().any(|t| t == template) {
                templates.push(template.to_string());
            }
        }
        info!(topic = %template, "Subscription added");

        if prior == ConnectionState::Connected {
            self.force(ConnectionState::Subscribing);
        } else {
            self.force(prior);
        }
    }

    fn network_up(&self) -> bool {
        *self.network.borrow()
    }

    /// Run until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> AgentResult<()> {
        let span = crate::connection_span!(&self.device_id);
        async move {
            let watcher = tokio::spawn(self.clone().watch_network(cancel.clone()));

            self.apply(ConnectionEvent::Started);
            while !cancel.is_cancelled() {
                if !self.step(&cancel).await {
                    break;
                }
            }

            watcher.abort();
            if let Err(e) = self.messaging.disconnect().await {
                debug!(error = %e, "Broker disconnect during shutdown failed");
            }
            self.force(ConnectionState::Disconnected);
            info!("Connection state machine stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Force `Disconnected` whenever every network adapter goes down
    async fn watch_network(self: Arc<Self>, cancel: CancellationToken) {
        let mut network = self.network.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = network.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let up = *network.borrow_and_update();
                    if !up {
                        warn!("Network adapter down, forcing disconnect");
                        self.apply(ConnectionEvent::NetworkDown);
                    }
                }
            }
        }
    }

    /// One iteration of the loop; `false` means cancellation was observed
    async fn step(&self, cancel: &CancellationToken) -> bool {
        match self.state() {
            ConnectionState::Unknown => {
                self.apply(ConnectionEvent::Started);
                true
            }
            ConnectionState::Disconnected => self.on_disconnected().await,
            ConnectionState::Authenticating => self.on_authenticating(cancel).await,
            ConnectionState::Connecting => self.on_connecting(cancel).await,
            ConnectionState::Subscribing => self.on_subscribing(cancel).await,
            ConnectionState::Connected => self.on_connected(cancel).await,
            ConnectionState::Paused => self.wait_for_state_change(cancel).await,
        }
    }

    async fn on_disconnected(&self) -> bool {
        if self.messaging.is_connected() {
            if let Err(e) = self.messaging.disconnect().await {
                debug!(error = %e, "Broker disconnect failed");
            }
        }
        self.subscribed.lock().unwrap_or_else(|p| p.into_inner()).clear();

        self.apply(ConnectionEvent::CredentialsChecked {
            auth_required: self.auth_required,
            token_stale: self.authenticator.is_stale(),
        });
        true
    }

    async fn on_authenticating(&self, cancel: &CancellationToken) -> bool {
        if !self.network_up() {
            debug!("Waiting for network before authenticating");
            return cancellable_sleep(cancel, NETWORK_POLL_INTERVAL).await;
        }

        match self.authenticator.authenticate(&self.device_id).await {
            Ok(()) => {
                self.apply(ConnectionEvent::LoginSucceeded);
                true
            }
            Err(e) => {
                self.raise(AgentError::from(e));
                self.apply(ConnectionEvent::LoginFailed);
                cancellable_sleep(cancel, self.retry_delay).await
            }
        }
    }

    async fn on_connecting(&self, cancel: &CancellationToken) -> bool {
        let credentials = if self.auth_required {
            match self.authenticator.token() {
                Some(token) => Some(BrokerCredentials {
                    username: self.device_id.clone(),
                    password: token,
                }),
                None => {
                    warn!("Token vanished before broker connect");
                    self.apply(ConnectionEvent::BrokerFailed);
                    return true;
                }
            }
        } else {
            None
        };

        match self.messaging.connect(credentials).await {
            Ok(()) => {
                self.subscribed.lock().unwrap_or_else(|p| p.into_inner()).clear();
                self.apply(ConnectionEvent::BrokerConnected);
                true
            }
            Err(e) => {
                error!(error = %e, "Broker connection failed");
                self.raise(AgentError::from(e));
                let proceed = cancellable_sleep(cancel, self.retry_delay).await;
                self.apply(ConnectionEvent::BrokerFailed);
                proceed
            }
        }
    }

    fn organization_id(&self) -> Option<String> {
        self.authenticator
            .organization_id()
            .or_else(|| self.fallback_organization.clone())
    }

    async fn on_subscribing(&self, cancel: &CancellationToken) -> bool {
        let organization = self.organization_id();
        let pending: Vec<String> = {
            let subscribed = self.subscribed.lock().unwrap_or_else(|p| p.into_inner());
            self.topic_templates()
                .iter()
                .filter_map(|template| {
                    let topic = resolve_topic(template, organization.as_deref(), &self.device_id);
                    if topic.is_none() {
                        warn!(template = %template, "No organization id to resolve topic, skipping");
                    }
                    topic
                })
                .filter(|topic| !subscribed.contains(topic))
                .collect()
        };

        for topic in pending {
            if let Err(e) = self.messaging.subscribe(&topic).await {
                error!(topic = %topic, error = %e, "Subscription failed");
                self.raise(AgentError::from(e));
                if let Err(e) = self.messaging.disconnect().await {
                    debug!(error = %e, "Broker disconnect failed");
                }
                let proceed = cancellable_sleep(cancel, self.retry_delay).await;
                self.apply(ConnectionEvent::SubscriptionFailed);
                return proceed;
            }
            self.subscribed
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(topic);
        }

        if self.apply(ConnectionEvent::SubscriptionsComplete) == ConnectionState::Connected
            && !self.ever_connected.swap(true, Ordering::SeqCst)
        {
            self.on_first_connect().await;
        }
        true
    }

    async fn on_first_connect(&self) {
        info!("First cloud connection since start");
        if let Some(reporter) = &self.crash_reporter {
            let sent = reporter.flush().await;
            if sent > 0 {
                info!(count = sent, "Queued pending crash reports");
            }
        }
    }

    /// Sit in `Connected` until the link drops or someone else changes the state
    async fn on_connected(&self, cancel: &CancellationToken) -> bool {
        let mut state = self.state_tx.subscribe();
        if *state.borrow_and_update() != ConnectionState::Connected {
            return true;
        }
        let mut link = self.messaging.link_status();
        if !*link.borrow_and_update() {
            return self.link_lost();
        }

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = state.changed() => true,
            changed = link.changed() => {
                if changed.is_err() || !*link.borrow() {
                    return self.link_lost();
                }
                true
            }
        }
    }

    fn link_lost(&self) -> bool {
        if self.state() == ConnectionState::Connected {
            warn!("Broker connection lost");
            self.events.error(ErrorSource::Connection, "broker connection lost");
        }
        self.apply(ConnectionEvent::LinkLost);
        true
    }

    async fn wait_for_state_change(&self, cancel: &CancellationToken) -> bool {
        let mut state = self.state_tx.subscribe();
        let current = *state.borrow_and_update();
        if current != ConnectionState::Paused {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = state.changed() => true,
        }
    }
}
