//! I/O side of the MQTT client
//!
//! Owns the rumqttc `AsyncClient`, drives its event loop on a background task and
//! turns ConnAck/SubAck packets into confirmations the caller can await.

use super::connection::{configure_mqtt_options, MqttError};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::transport::{BrokerCredentials, InboundMessage, MessagingClient};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_LOOP_CAPACITY: usize = 10;
const EVENT_LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Progress of a single connection attempt
#[derive(Debug, Clone, PartialEq)]
enum LinkProgress {
    Connecting,
    Connected,
    Failed(String),
}

struct Session {
    client: AsyncClient,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type InboundSender = Arc<RwLock<Option<mpsc::Sender<InboundMessage>>>>;

/// MQTT v5 implementation of [`MessagingClient`]
pub struct MqttClient {
    client_id: String,
    config: MqttSection,
    session: Mutex<Option<Session>>,
    link_tx: watch::Sender<bool>,
    inbound: InboundSender,
    suback_tx: mpsc::UnboundedSender<bool>,
    suback_rx: Mutex<mpsc::UnboundedReceiver<bool>>,
}

impl MqttClient {
    pub fn new(client_id: &str, config: MqttSection) -> Self {
        let (link_tx, _) = watch::channel(false);
        let (suback_tx, suback_rx) = mpsc::unbounded_channel();
        Self {
            client_id: client_id.to_string(),
            config,
            session: Mutex::new(None),
            link_tx,
            inbound: Arc::new(RwLock::new(None)),
            suback_tx,
            suback_rx: Mutex::new(suback_rx),
        }
    }

    /// Wait for ConnAck with timeout
    async fn wait_for_connection_confirmation(
        mut progress_rx: watch::Receiver<LinkProgress>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let result = tokio::time::timeout(timeout, async {
            loop {
                let progress = progress_rx.borrow_and_update().clone();
                match progress {
                    LinkProgress::Connected => return Ok(()),
                    LinkProgress::Failed(reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason))
                    }
                    LinkProgress::Connecting => {}
                }
                if progress_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "event loop stopped before ConnAck".to_string(),
                    ));
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(MqttError::ConnectTimeout(timeout)),
        }
    }

    /// Poll the event loop until cancelled or the link fails
    async fn run_event_loop(
        mut event_loop: EventLoop,
        cancel: CancellationToken,
        progress_tx: watch::Sender<LinkProgress>,
        link_tx: watch::Sender<bool>,
        inbound: InboundSender,
        suback_tx: mpsc::UnboundedSender<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = event_loop.poll() => event,
            };

            match event {
                Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged => {
                        info!("Broker acknowledged connection");
                        let _ = progress_tx.send(LinkProgress::Connected);
                        link_tx.send_replace(true);
                    }
                    EventRoute::MessageReceived(message) => {
                        Self::forward_inbound(&inbound, message).await;
                    }
                    EventRoute::SubscriptionConfirmed { packet_id, granted } => {
                        debug!(target: "mqtt_transport", packet_id, granted, "SubAck received");
                        let _ = suback_tx.send(granted);
                    }
                    EventRoute::Disconnected => {
                        warn!("Broker closed the connection");
                        break;
                    }
                    EventRoute::InfrastructureEvent(event) => {
                        debug!(target: "mqtt_transport", "MQTT event: {}", event);
                    }
                    EventRoute::OutgoingEvent => {}
                },
                Err(e) => {
                    error!(error = %e, "MQTT event loop error");
                    let _ = progress_tx.send(LinkProgress::Failed(e.to_string()));
                    break;
                }
            }
        }

        link_tx.send_replace(false);
        debug!(target: "mqtt_transport", "MQTT event loop stopped");
    }

    async fn forward_inbound(inbound: &InboundSender, message: InboundMessage) {
        debug!(target: "mqtt_transport", topic = %message.topic, "Received MQTT message");
        let sender = inbound
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        match sender {
            Some(sender) => {
                if let Err(e) = sender.send(message).await {
                    error!("Failed to forward inbound message: {}", e);
                }
            }
            None => warn!("Received MQTT message but no inbound sender configured - message dropped"),
        }
    }

    async fn stop_session(session: Session) {
        if let Err(e) = session.client.disconnect().await {
            debug!(target: "mqtt_transport", error = %e, "Disconnect request not delivered");
        }
        session.cancel.cancel();

        match tokio::time::timeout(EVENT_LOOP_STOP_TIMEOUT, session.handle).await {
            Ok(Ok(())) => debug!(target: "mqtt_transport", "Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Err(_) => warn!("Event loop task didn't shut down gracefully, dropping it"),
            _ => {}
        }
    }
}

#[async_trait]
impl MessagingClient for MqttClient {
    async fn connect(&self, credentials: Option<BrokerCredentials>) -> Result<(), MqttError> {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            Self::stop_session(previous).await;
        }

        let options = configure_mqtt_options(&self.client_id, &self.config, credentials.as_ref())?;
        let (client, event_loop) = AsyncClient::new(options, EVENT_LOOP_CAPACITY);
        let (progress_tx, progress_rx) = watch::channel(LinkProgress::Connecting);
        let cancel = CancellationToken::new();

        info!(broker = %self.config.broker_url, "Connecting to MQTT broker");
        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            cancel.clone(),
            progress_tx,
            self.link_tx.clone(),
            self.inbound.clone(),
            self.suback_tx.clone(),
        ));

        let new_session = Session {
            client,
            cancel,
            handle,
        };

        match Self::wait_for_connection_confirmation(progress_rx, self.config.connect_timeout())
            .await
        {
            Ok(()) => {
                *session = Some(new_session);
                Ok(())
            }
            Err(e) => {
                Self::stop_session(new_session).await;
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        if let Some(session) = self.session.lock().await.take() {
            Self::stop_session(session).await;
            info!("MQTT client disconnected");
        }
        self.link_tx.send_replace(false);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        // One SUBSCRIBE in flight at a time so the next SubAck is ours
        let mut subacks = self.suback_rx.lock().await;
        while subacks.try_recv().is_ok() {}

        {
            let session = self.session.lock().await;
            let session = session.as_ref().ok_or(MqttError::NotConnected)?;
            session
                .client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        }

        match tokio::time::timeout(self.config.connect_timeout(), subacks.recv()).await {
            Ok(Some(true)) => {
                info!(topic = %topic, "Subscribed");
                Ok(())
            }
            Ok(Some(false)) => Err(MqttError::SubscriptionRejected {
                topic: topic.to_string(),
                reason: "broker refused the filter".to_string(),
            }),
            Ok(None) => Err(MqttError::NotConnected),
            Err(_) => Err(MqttError::SubscriptionRejected {
                topic: topic.to_string(),
                reason: "no SubAck received".to_string(),
            }),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(MqttError::NotConnected)?;
        session
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;
        debug!(target: "mqtt_transport", topic = %topic, "Published message");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.link_tx.borrow()
    }

    fn link_status(&self) -> watch::Receiver<bool> {
        self.link_tx.subscribe()
    }

    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        *self.inbound.write().unwrap_or_else(|p| p.into_inner()) = Some(sender);
    }
}
