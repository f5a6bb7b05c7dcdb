//! Mock implementations for testing
//!
//! Provides mock MessagingClient, Platform and RecordSender implementations so the
//! agent can be exercised without a broker, device hardware or cloud endpoints.

use crate::platform::{HealthSnapshot, Platform, PlatformError};
use crate::queue::{DeliveryError, QueuedRecord, RecordSender};
use crate::transport::{BrokerCredentials, InboundMessage, MessagingClient, MqttError};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub type PublishedMessage = (String, Vec<u8>);

/// Mock broker client
///
/// `connect` flips the link watch to `true`, `disconnect` and [`drop_link`] flip
/// it back. Subscribes and publishes are recorded.
///
/// [`drop_link`]: MockMessagingClient::drop_link
#[derive(Debug)]
pub struct MockMessagingClient {
    link: watch::Sender<bool>,
    fail_connect: AtomicBool,
    fail_subscribe: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    credentials: Mutex<Vec<Option<BrokerCredentials>>>,
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    inbound: Mutex<Option<mpsc::Sender<InboundMessage>>>,
}

impl MockMessagingClient {
    pub fn new() -> Self {
        let (link, _) = watch::channel(false);
        Self {
            link,
            fail_connect: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            credentials: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            inbound: Mutex::new(None),
        }
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Simulate the broker dropping the session
    pub fn drop_link(&self) {
        self.link.send_replace(false);
    }

    pub fn connect_count(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Credentials passed to every `connect`, in call order
    pub fn credentials(&self) -> Vec<Option<BrokerCredentials>> {
        self.credentials.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Hand a message to whoever registered for inbound traffic
    pub async fn inject(&self, message: InboundMessage) -> bool {
        let sender = self
            .inbound
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        match sender {
            Some(sender) => sender.send(message).await.is_ok(),
            None => false,
        }
    }
}

impl Default for MockMessagingClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagingClient for MockMessagingClient {
    async fn connect(&self, credentials: Option<BrokerCredentials>) -> Result<(), MqttError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.credentials
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(credentials);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionFailedStr(
                "Mock connection failure".to_string(),
            ));
        }
        self.link.send_replace(true);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.link.send_replace(false);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(MqttError::SubscriptionRejected {
                topic: topic.to_string(),
                reason: "Mock subscription failure".to_string(),
            });
        }
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((topic.to_string(), payload));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.link.borrow()
    }

    fn link_status(&self) -> watch::Receiver<bool> {
        self.link.subscribe()
    }

    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        *self.inbound.lock().unwrap_or_else(|p| p.into_inner()) = Some(sender);
    }
}

/// Mock device platform
///
/// Crypto is the identity function, so a test login response can carry the
/// plaintext token directly. The network starts up.
#[derive(Debug)]
pub struct MockPlatform {
    device_id: String,
    os_version: Mutex<String>,
    fail_crypto: AtomicBool,
    fail_health: AtomicBool,
    fail_reset: AtomicBool,
    network: watch::Sender<bool>,
    shutdown_delay: Mutex<Duration>,
    shutdown_calls: AtomicUsize,
    shutdown_done: AtomicBool,
    reset_calls: AtomicUsize,
    reset_after_shutdown: AtomicBool,
}

impl MockPlatform {
    pub fn new(device_id: &str) -> Self {
        let (network, _) = watch::channel(true);
        Self {
            device_id: device_id.to_uppercase(),
            os_version: Mutex::new("1.0.0".to_string()),
            fail_crypto: AtomicBool::new(false),
            fail_health: AtomicBool::new(false),
            fail_reset: AtomicBool::new(false),
            network,
            shutdown_delay: Mutex::new(Duration::ZERO),
            shutdown_calls: AtomicUsize::new(0),
            shutdown_done: AtomicBool::new(false),
            reset_calls: AtomicUsize::new(0),
            reset_after_shutdown: AtomicBool::new(false),
        }
    }

    pub fn set_os_version(&self, version: &str) {
        *self.os_version.lock().unwrap_or_else(|p| p.into_inner()) = version.to_string();
    }

    pub fn fail_crypto(&self, fail: bool) {
        self.fail_crypto.store(fail, Ordering::SeqCst);
    }

    pub fn fail_health(&self, fail: bool) {
        self.fail_health.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reset(&self, fail: bool) {
        self.fail_reset.store(fail, Ordering::SeqCst);
    }

    pub fn set_network(&self, up: bool) {
        self.network.send_replace(up);
    }

    /// How long `request_shutdown` takes before returning
    pub fn set_shutdown_delay(&self, delay: Duration) {
        *self.shutdown_delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> usize {
        self.reset_calls.load(Ordering::SeqCst)
    }

    /// Whether the last reset started only after `request_shutdown` had returned
    pub fn reset_followed_shutdown(&self) -> bool {
        self.reset_after_shutdown.load(Ordering::SeqCst)
    }

    fn crypto_result(&self, data: &[u8]) -> Result<Vec<u8>, PlatformError> {
        if self.fail_crypto.load(Ordering::SeqCst) {
            return Err(PlatformError::Crypto("Mock crypto failure".to_string()));
        }
        Ok(data.to_vec())
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn os_version(&self) -> String {
        self.os_version
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn coprocessor_version(&self) -> Option<String> {
        Some("cp-0.9".to_string())
    }

    fn rsa_decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PlatformError> {
        self.crypto_result(ciphertext)
    }

    fn aes_cbc_decrypt(
        &self,
        _key: &[u8],
        _iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, PlatformError> {
        self.crypto_result(ciphertext)
    }

    async fn health_snapshot(&self) -> Result<HealthSnapshot, PlatformError> {
        if self.fail_health.load(Ordering::SeqCst) {
            return Err(PlatformError::Metrics("Mock metrics failure".to_string()));
        }
        Ok(HealthSnapshot {
            timestamp: Utc::now(),
            cpu_temperature_celsius: Some(48.5),
            memory_used_bytes: 256 * 1024 * 1024,
            memory_total_bytes: 1024 * 1024 * 1024,
            disk_used_bytes: 2 * 1024 * 1024 * 1024,
            disk_total_bytes: 8 * 1024 * 1024 * 1024,
            os_version: self.os_version(),
            coprocessor_version: self.coprocessor_version(),
            battery_percent: Some(87),
            uptime_secs: 3600,
        })
    }

    fn network_status(&self) -> watch::Receiver<bool> {
        self.network.subscribe()
    }

    async fn request_shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.shutdown_delay.lock().unwrap_or_else(|p| p.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.shutdown_done.store(true, Ordering::SeqCst);
    }

    async fn reset_device(&self) -> Result<(), PlatformError> {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        self.reset_after_shutdown
            .store(self.shutdown_done.load(Ordering::SeqCst), Ordering::SeqCst);
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(PlatformError::Reset("Mock reset failure".to_string()));
        }
        Ok(())
    }
}

/// Records everything it is asked to deliver
#[derive(Debug, Default)]
pub struct MockRecordSender {
    delivered: Mutex<Vec<QueuedRecord>>,
    should_fail: AtomicBool,
    attempts: AtomicUsize,
}

impl MockRecordSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        let sender = Self::default();
        sender.should_fail.store(true, Ordering::SeqCst);
        sender
    }

    pub fn set_failure(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// Every send call, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<QueuedRecord> {
        self.delivered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl RecordSender for MockRecordSender {
    async fn send(&self, record: &QueuedRecord) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected { status: 503 });
        }
        self.delivered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record.clone());
        Ok(())
    }
}
