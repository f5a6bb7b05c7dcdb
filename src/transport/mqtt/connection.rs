//! Pure connection configuration and topic handling for the MQTT client

use crate::config::MqttSection;
use crate::transport::BrokerCredentials;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const TLS_PORT: u16 = 8883;
const PLAIN_PORT: u16 = 1883;

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
    #[error("No broker acknowledgement within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription to {topic} rejected: {reason}")]
    SubscriptionRejected { topic: String, reason: String },
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected to broker")]
    NotConnected,
}

/// Build rumqttc options for one connection attempt
///
/// TLS is used for `mqtts://`, for port 8883, or when forced by configuration.
pub fn configure_mqtt_options(
    client_id: &str,
    config: &MqttSection,
    credentials: Option<&BrokerCredentials>,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let secure_scheme = url.scheme() == "mqtts" || url.scheme() == "ssl";
    let port = url
        .port()
        .unwrap_or(if secure_scheme { TLS_PORT } else { PLAIN_PORT });

    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if use_tls(secure_scheme, port, config.tls) {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    Ok(mqtt_options)
}

fn use_tls(secure_scheme: bool, port: u16, forced: bool) -> bool {
    forced || secure_scheme || port == TLS_PORT
}

/// Substitute `{OID}` and `{ID}` macros in a topic template
///
/// Returns `None` when the template needs an organization id that isn't known yet.
pub fn resolve_topic(template: &str, organization_id: Option<&str>, device_id: &str) -> Option<String> {
    let topic = template.replace("{ID}", &device_id.to_uppercase());
    if topic.contains("{OID}") {
        let oid = organization_id?;
        Some(topic.replace("{OID}", oid))
    } else {
        Some(topic)
    }
}
