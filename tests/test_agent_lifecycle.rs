//! End-to-end agent lifecycle with mocked broker, platform and cloud delivery

mod test_helpers;

use cloudlink::commands::COMMAND_NAME_PROPERTY;
use cloudlink::queue::Severity;
use cloudlink::testing::{MockMessagingClient, MockPlatform, MockRecordSender};
use cloudlink::transport::InboundMessage;
use cloudlink::{AgentEvent, CloudAgent, ConnectionState};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Running {
    agent: CloudAgent,
    messaging: Arc<MockMessagingClient>,
    sender: Arc<MockRecordSender>,
    events: broadcast::Receiver<AgentEvent>,
    _dir: tempfile::TempDir,
}

async fn start_agent() -> Running {
    let dir = tempfile::tempdir().unwrap();
    let config = test_helpers::unauthenticated_config(dir.path());
    let messaging = Arc::new(MockMessagingClient::new());
    let sender = Arc::new(MockRecordSender::new());
    let agent = CloudAgent::with_components(
        config,
        Arc::new(MockPlatform::new("DEV1")),
        messaging.clone(),
        sender.clone(),
    )
    .unwrap();
    let events = agent.subscribe_events();
    agent.start().await.unwrap();
    Running {
        agent,
        messaging,
        sender,
        events,
        _dir: dir,
    }
}

/// Wait for the first event `pick` accepts
async fn next_matching<T>(
    events: &mut broadcast::Receiver<AgentEvent>,
    pick: impl Fn(&AgentEvent) -> Option<T>,
) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) => {
                if let Some(found) = pick(&event) {
                    return found;
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            other => panic!("event never arrived: {other:?}"),
        }
    }
}

async fn wait_connected(events: &mut broadcast::Receiver<AgentEvent>) {
    next_matching(events, |e| match e {
        AgentEvent::ConnectionStateChanged(ConnectionState::Connected) => Some(()),
        _ => None,
    })
    .await;
}

#[tokio::test]
async fn test_agent_connects_and_subscribes_default_topics() {
    let mut running = start_agent().await;
    wait_connected(&mut running.events).await;

    assert_eq!(running.agent.connection_state(), ConnectionState::Connected);
    assert_eq!(
        running.messaging.subscriptions(),
        vec!["org1/commands/DEV1", "org1/ota/DEV1"]
    );
    let updates = running.agent.updates().unwrap().clone();
    assert!(test_helpers::eventually(|| updates.state() == cloudlink::UpdateState::Connected).await);

    running.agent.shutdown().await;
    assert!(!running.agent.is_running());
    assert_eq!(running.agent.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_inbound_command_reaches_handler() {
    let mut running = start_agent().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    running
        .agent
        .commands()
        .subscribe::<serde_json::Value, _>("Reboot", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    wait_connected(&mut running.events).await;

    let delivered = running
        .messaging
        .inject(
            InboundMessage::new("org1/commands/DEV1", Vec::new())
                .with_property(COMMAND_NAME_PROPERTY, "RebootCommand"),
        )
        .await;

    assert!(delivered);
    assert!(test_helpers::eventually(|| calls.load(Ordering::SeqCst) == 1).await);
    running.agent.shutdown().await;
}

#[tokio::test]
async fn test_update_notice_is_announced() {
    let mut running = start_agent().await;
    wait_connected(&mut running.events).await;

    let notice = json!({
        "mpakId": "2024.3",
        "version": "1.0.0",
        "mpakDownloadUrl": "http://127.0.0.1:9/2024.3.mpak",
        "summary": "Spring release",
    });
    running
        .messaging
        .inject(InboundMessage::new(
            "org1/ota/DEV1",
            notice.to_string().into_bytes(),
        ))
        .await;

    let announced = next_matching(&mut running.events, |e| match e {
        AgentEvent::UpdateAvailable(update) => Some(update.clone()),
        _ => None,
    })
    .await;
    assert_eq!(announced.id, "2024.3");
    assert_eq!(announced.summary.as_deref(), Some("Spring release"));
    assert!(running.agent.updates().unwrap().get("2024.3").is_some());
    running.agent.shutdown().await;
}

#[tokio::test]
async fn test_malformed_notice_raises_error_event() {
    let mut running = start_agent().await;
    wait_connected(&mut running.events).await;

    running
        .messaging
        .inject(InboundMessage::new("org1/ota/DEV1", b"not json".to_vec()))
        .await;

    let source = next_matching(&mut running.events, |e| match e {
        AgentEvent::ErrorOccurred(error) => Some(error.source),
        _ => None,
    })
    .await;
    assert_eq!(source, cloudlink::ErrorSource::Update);
    running.agent.shutdown().await;
}

#[tokio::test]
async fn test_logs_are_delivered_once_connected() {
    let mut running = start_agent().await;
    running.agent.log(Severity::Information, "booted").unwrap();
    wait_connected(&mut running.events).await;

    let sender = running.sender.clone();
    assert!(test_helpers::eventually(|| sender.delivered().len() == 1).await);
    assert_eq!(sender.delivered()[0].payload["message"], "booted");
    assert!(running.agent.queue().is_empty());
    running.agent.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_background_download() {
    let server = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .respond_with(
            wiremock::ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 16])
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let mut running = start_agent().await;
    wait_connected(&mut running.events).await;
    let updates = running.agent.updates().unwrap().clone();
    let notice = json!({
        "mpakId": "slow",
        "mpakDownloadUrl": format!("{}/slow.mpak", server.uri()),
    });
    updates.handle_notice(notice.to_string().as_bytes()).unwrap();

    updates.retrieve_update("slow").unwrap();
    assert!(test_helpers::eventually(|| updates.is_downloading("slow")).await);

    tokio::time::timeout(Duration::from_secs(10), running.agent.shutdown())
        .await
        .unwrap();
    assert!(!updates.is_downloading("slow"));
}
