//! Delivery of queued records to the cloud data host

use super::{DeliveryError, QueuedRecord};
use crate::auth::Authenticator;
use crate::config::CloudSection;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tracing::debug;

/// Delivers one record; an error leaves the record queued
#[async_trait]
pub trait RecordSender: Send + Sync {
    async fn send(&self, record: &QueuedRecord) -> Result<(), DeliveryError>;
}

/// Posts records as JSON to `{data_host}/api/logs` or `/api/events`
pub struct HttpRecordSender {
    client: Client,
    data_host: String,
    authenticator: Option<Arc<Authenticator>>,
}

impl HttpRecordSender {
    /// `authenticator` is `None` when the cloud runs without authentication
    pub fn new(
        cloud: &CloudSection,
        authenticator: Option<Arc<Authenticator>>,
    ) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(cloud.request_timeout())
            .build()
            .map_err(|e| DeliveryError::Request(Box::new(e)))?;
        Ok(Self {
            client,
            data_host: cloud.data_host.trim_end_matches('/').to_string(),
            authenticator,
        })
    }
}

#[async_trait]
impl RecordSender for HttpRecordSender {
    async fn send(&self, record: &QueuedRecord) -> Result<(), DeliveryError> {
        let url = format!("{}{}", self.data_host, record.endpoint.path());
        let mut request = self.client.post(&url).json(&record.payload);

        if let Some(authenticator) = &self.authenticator {
            let token = authenticator
                .token()
                .ok_or(DeliveryError::NotAuthenticated)?;
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Request(Box::new(e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }

        debug!(sequence = record.sequence, url = %url, "Record delivered");
        Ok(())
    }
}
