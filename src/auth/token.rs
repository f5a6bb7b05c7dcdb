//! Bearer token bookkeeping

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// A decrypted bearer token and when it was obtained
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: String,
    pub obtained_at: DateTime<Utc>,
    obtained_instant: Instant,
}

impl AuthToken {
    pub fn new(token: String) -> Self {
        Self {
            token,
            obtained_at: Utc::now(),
            obtained_instant: Instant::now(),
        }
    }

    /// Monotonic age so wall-clock corrections after time sync don't affect expiry
    pub fn age(&self) -> Duration {
        self.obtained_instant.elapsed()
    }

    pub fn is_stale(&self, expiry: Duration) -> bool {
        self.age() >= expiry
    }

    pub fn organization_id(&self) -> Option<String> {
        organization_id_from_token(&self.token)
    }
}

/// Keep only characters that can appear in a token
///
/// AES decryption without unpadding leaves padding bytes and occasionally garbage at
/// the tail; none of those fall in the allowed class.
pub fn sanitize_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '=' | '.'))
        .collect()
}

/// Read the `oid` claim from a JWT-shaped token
pub fn organization_id_from_token(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .or_else(|_| URL_SAFE.decode(payload))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    match claims.get("oid")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt_with_claims(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn test_sanitize_strips_padding_artifacts() {
        let raw = "abc-DEF_123+xyz=\u{5}\u{5}\u{5}\u{5}\u{5}";
        assert_eq!(sanitize_token(raw), "abc-DEF_123+xyz=");
    }

    #[test]
    fn test_sanitize_keeps_jwt_separators() {
        assert_eq!(sanitize_token("aaa.bbb.ccc\0\0"), "aaa.bbb.ccc");
    }

    #[test]
    fn test_sanitize_drops_whitespace_and_symbols() {
        assert_eq!(sanitize_token(" to ken!\n"), "token");
    }

    #[test]
    fn test_organization_id_from_jwt() {
        let token = jwt_with_claims(serde_json::json!({"oid": "org-42", "sub": "device"}));
        assert_eq!(organization_id_from_token(&token).as_deref(), Some("org-42"));
    }

    #[test]
    fn test_organization_id_missing_claim() {
        let token = jwt_with_claims(serde_json::json!({"sub": "device"}));
        assert_eq!(organization_id_from_token(&token), None);
        assert_eq!(organization_id_from_token("opaque-token"), None);
    }

    #[test]
    fn test_token_staleness() {
        let token = AuthToken::new("t".to_string());
        assert!(!token.is_stale(Duration::from_secs(3600)));
        assert!(token.is_stale(Duration::ZERO));
    }
}
