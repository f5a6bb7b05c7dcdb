//! HTTP delivery of queued records to the data host

mod test_helpers;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cloudlink::auth::Authenticator;
use cloudlink::queue::{DeliveryError, Endpoint, HttpRecordSender, QueuedRecord, RecordSender};
use cloudlink::testing::MockPlatform;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn record(endpoint: Endpoint) -> QueuedRecord {
    QueuedRecord {
        payload: json!({"deviceId": "DEV1", "message": "hello"}),
        endpoint,
        sequence: 1,
    }
}

#[tokio::test]
async fn test_unauthenticated_post_to_endpoint_path() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/events"))
        .and(body_json(json!({"deviceId": "DEV1", "message": "hello"})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_helpers::test_config(dir.path(), &server.uri());
    let sender = HttpRecordSender::new(&config.cloud, None).unwrap();

    sender.send(&record(Endpoint::Events)).await.unwrap();
}

#[tokio::test]
async fn test_rejection_keeps_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_helpers::test_config(dir.path(), &server.uri());
    let sender = HttpRecordSender::new(&config.cloud, None).unwrap();

    assert!(matches!(
        sender.send(&record(Endpoint::Logs)).await,
        Err(DeliveryError::Rejected { status: 500 })
    ));
}

#[tokio::test]
async fn test_bearer_token_required_when_authenticating() {
    let server = MockServer::start().await;
    let token = test_helpers::jwt_with_oid("org1");
    Mock::given(method("POST"))
        .and(path("/api/devices/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "encryptedKey": BASE64.encode(b"k"),
            "encryptedToken": BASE64.encode(token.as_bytes()),
            "iv": BASE64.encode(b"iv"),
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/logs"))
        .and(header("authorization", format!("Bearer {token}").as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_helpers::test_config(dir.path(), &server.uri());
    let authenticator = Arc::new(
        Authenticator::new(&config.cloud, Arc::new(MockPlatform::new("DEV1"))).unwrap(),
    );
    let sender = HttpRecordSender::new(&config.cloud, Some(authenticator.clone())).unwrap();

    assert!(matches!(
        sender.send(&record(Endpoint::Logs)).await,
        Err(DeliveryError::NotAuthenticated)
    ));

    authenticator.authenticate("DEV1").await.unwrap();
    sender.send(&record(Endpoint::Logs)).await.unwrap();
}
