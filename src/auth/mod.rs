//! Device authentication against the cloud login endpoint
//!
//! The login exchange is hybrid-encrypted: the server returns a session key wrapped
//! with the device public key and a token encrypted with that session key. Both
//! decrypt steps go through the injected [`Platform`].

mod token;

pub use token::{organization_id_from_token, sanitize_token, AuthToken};

use crate::config::CloudSection;
use crate::platform::{Platform, PlatformError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const LOGIN_PATH: &str = "/api/devices/login";

/// Authentication errors, split by the diagnosis they lead to
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Device is not provisioned with the cloud")]
    NotProvisioned,
    #[error("Login server fault (HTTP {0})")]
    ServerFault(u16),
    #[error("Login rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("Token decryption failed, device needs reprovisioning: {0}")]
    Decrypt(String),
    #[error("Invalid login response: {0}")]
    InvalidResponse(String),
    #[error("Login request failed: {message}")]
    Request {
        message: String,
        /// TLS failed while the system clock looks wrong
        likely_clock_skew: bool,
    },
}

impl AuthError {
    /// Crypto failures are escalated as system errors rather than plain auth failures
    pub fn is_crypto_failure(&self) -> bool {
        matches!(self, AuthError::Decrypt(_))
    }
}

impl From<PlatformError> for AuthError {
    fn from(error: PlatformError) -> Self {
        AuthError::Decrypt(error.to_string())
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "Id")]
    id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(alias = "EncryptedKey")]
    encrypted_key: String,
    #[serde(alias = "EncryptedToken")]
    encrypted_token: String,
    #[serde(alias = "Iv", alias = "IV")]
    iv: String,
}

/// Exchanges the device identity for a bearer token and caches it
pub struct Authenticator {
    client: Client,
    login_url: String,
    token_expiry: Duration,
    platform: Arc<dyn Platform>,
    token: RwLock<Option<AuthToken>>,
}

impl Authenticator {
    pub fn new(cloud: &CloudSection, platform: Arc<dyn Platform>) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(cloud.request_timeout())
            .build()
            .map_err(|e| AuthError::Request {
                message: e.to_string(),
                likely_clock_skew: false,
            })?;

        Ok(Self {
            client,
            login_url: format!("{}{}", cloud.auth_host.trim_end_matches('/'), LOGIN_PATH),
            token_expiry: cloud.token_expiry(),
            platform,
            token: RwLock::new(None),
        })
    }

    /// Log in and cache the resulting token; any failure clears the cache
    pub async fn authenticate(&self, device_id: &str) -> Result<(), AuthError> {
        match self.login(device_id).await {
            Ok(token) => {
                info!(
                    device_id = %device_id,
                    organization = ?token.organization_id(),
                    "Authentication succeeded"
                );
                *self.token.write().unwrap_or_else(|p| p.into_inner()) = Some(token);
                Ok(())
            }
            Err(e) => {
                self.invalidate();
                match &e {
                    AuthError::NotProvisioned => {
                        error!(device_id = %device_id, "Authentication failed: device not provisioned");
                    }
                    AuthError::ServerFault(status) => {
                        error!(status, "Authentication failed: server fault");
                    }
                    AuthError::Decrypt(reason) => {
                        error!(reason = %reason, "Authentication failed: decrypt error, device needs reprovisioning");
                    }
                    AuthError::Request {
                        message,
                        likely_clock_skew: true,
                    } => {
                        error!(
                            error = %message,
                            now = %Utc::now(),
                            "Authentication failed: TLS error, system clock is probably wrong"
                        );
                    }
                    other => {
                        error!(error = %other, "Authentication failed");
                    }
                }
                Err(e)
            }
        }
    }

    async fn login(&self, device_id: &str) -> Result<AuthToken, AuthError> {
        let device_id = device_id.to_uppercase();
        debug!(url = %self.login_url, "Sending login request");

        let response = self
            .client
            .post(&self.login_url)
            .json(&LoginRequest { id: &device_id })
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => return Err(AuthError::NotProvisioned),
            StatusCode::INTERNAL_SERVER_ERROR => {
                return Err(AuthError::ServerFault(status.as_u16()))
            }
            s if !s.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(AuthError::Rejected {
                    status: s.as_u16(),
                    body,
                });
            }
            _ => {}
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        let token = self.decrypt_token(&login)?;
        if token.is_empty() {
            return Err(AuthError::InvalidResponse(
                "decrypted token is empty".to_string(),
            ));
        }
        Ok(AuthToken::new(token))
    }

    fn decrypt_token(&self, login: &LoginResponse) -> Result<String, AuthError> {
        let encrypted_key = decode_base64("encryptedKey", &login.encrypted_key)?;
        let encrypted_token = decode_base64("encryptedToken", &login.encrypted_token)?;
        let iv = decode_base64("iv", &login.iv)?;

        let session_key = self.platform.rsa_decrypt(&encrypted_key)?;
        let raw_token = self
            .platform
            .aes_cbc_decrypt(&session_key, &iv, &encrypted_token)?;

        Ok(sanitize_token(&String::from_utf8_lossy(&raw_token)))
    }

    /// Current token, if any, regardless of age
    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|t| t.token.clone())
    }

    /// Organization identifier carried in the token payload
    pub fn organization_id(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(|t| t.organization_id())
    }

    /// A missing token counts as stale
    pub fn is_stale(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map_or(true, |t| t.is_stale(self.token_expiry))
    }

    pub fn invalidate(&self) {
        *self.token.write().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>, AuthError> {
    BASE64
        .decode(value.trim())
        .map_err(|e| AuthError::InvalidResponse(format!("{field} is not valid base64: {e}")))
}

/// Classify a transport failure, flagging TLS errors that coincide with an unset clock
fn request_error(error: reqwest::Error) -> AuthError {
    let message = error.to_string();
    let tls_related = error.is_connect() || message.to_lowercase().contains("certificate");
    let likely_clock_skew = tls_related && clock_looks_unset();
    if likely_clock_skew {
        warn!("System clock predates the minimum plausible date, TLS validation will fail");
    }
    AuthError::Request {
        message,
        likely_clock_skew,
    }
}

/// Devices without an RTC boot at the epoch until time sync completes
pub fn clock_looks_unset() -> bool {
    match Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single() {
        Some(floor) => Utc::now() < floor,
        None => false,
    }
}
