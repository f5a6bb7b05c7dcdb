//! Update download, apply and completion against a mocked package server

mod test_helpers;

use cloudlink::config::HashPolicy;
use cloudlink::events::{AgentEvent, EventBus};
use cloudlink::supervisor::TaskSupervisor;
use cloudlink::testing::MockPlatform;
use cloudlink::update::agent::NoticeOutcome;
use cloudlink::update::UpdateError;
use cloudlink::UpdateAgent;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    agent: Arc<UpdateAgent>,
    platform: Arc<MockPlatform>,
    events: broadcast::Receiver<AgentEvent>,
    _dir: tempfile::TempDir,
}

fn fixture(hash_policy: HashPolicy) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_helpers::unauthenticated_config(dir.path());
    config.update.hash_policy = hash_policy;
    fixture_in(dir, &config.update)
}

fn fixture_in(dir: tempfile::TempDir, update: &cloudlink::config::UpdateSection) -> Fixture {
    let platform = Arc::new(MockPlatform::new("DEV1"));
    let bus = EventBus::new();
    let events = bus.subscribe();
    let agent = Arc::new(
        UpdateAgent::new(
            update,
            &dir.path().join("updates"),
            platform.clone(),
            bus.clone(),
            TaskSupervisor::new(bus, CancellationToken::new()),
        )
        .unwrap(),
    );
    Fixture {
        agent,
        platform,
        events,
        _dir: dir,
    }
}

fn package_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn write_package(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    for (name, contents) in entries {
        writer
            .start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap();
}

fn drain(events: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_interrupted_download_resumes_with_range() {
    let server = MockServer::start().await;
    let body = package_bytes(1000);
    let first = 400;

    Mock::given(method("GET"))
        .and(path("/pkg/u1.mpak"))
        .and(header("range", "bytes=400-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 400-999/1000")
                .set_body_bytes(body[first..].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pkg/u1.mpak"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 0-399/1000")
                .set_body_bytes(body[..first].to_vec()),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let mut fx = fixture(HashPolicy::Enforce);
    let notice = json!({
        "id": "u1",
        "osVersion": "1.0.0",
        "mpakDownloadUrl": format!("{}/pkg/u1.mpak", server.uri()),
        "hash": hex::encode(Sha256::digest(&body)),
        "downloadSize": 1000,
    });
    assert_eq!(
        fx.agent.handle_notice(notice.to_string().as_bytes()).unwrap(),
        NoticeOutcome::New
    );

    let retrieved = fx.agent.download("u1").await.unwrap();

    assert!(retrieved.retrieved);
    assert_eq!(retrieved.download_progress, 1000);
    let on_disk = std::fs::read(fx.agent.package_path("u1")).unwrap();
    assert_eq!(on_disk, body);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].headers.get("range").is_none());
    assert_eq!(
        requests[1].headers.get("range").unwrap().to_str().unwrap(),
        "bytes=400-"
    );

    let events = drain(&mut fx.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::UpdateRetrieved(m) if m.id == "u1")));
    let last_progress = events.iter().rev().find_map(|e| match e {
        AgentEvent::UpdateProgress {
            downloaded_bytes,
            total_bytes,
            ..
        } => Some((*downloaded_bytes, *total_bytes)),
        _ => None,
    });
    assert_eq!(last_progress, Some((1000, Some(1000))));
}

#[tokio::test]
async fn test_os_mismatch_downloads_bundle() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bundle.mpak"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"bundle".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let fx = fixture(HashPolicy::Warn);
    fx.platform.set_os_version("1.0.0");
    let notice = json!({
        "id": "u2",
        "osVersion": "2.0.0",
        "mpakDownloadUrl": format!("{}/app.mpak", server.uri()),
        "mpakWithOsDownloadUrl": format!("{}/bundle.mpak", server.uri()),
    });
    fx.agent.handle_notice(notice.to_string().as_bytes()).unwrap();

    fx.agent.download("u2").await.unwrap();
    assert_eq!(std::fs::read(fx.agent.package_path("u2")).unwrap(), b"bundle");
}

#[tokio::test]
async fn test_exhausted_retries_report_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut fx = fixture(HashPolicy::Warn);
    let notice = json!({"id": "u3", "mpakDownloadUrl": format!("{}/u3", server.uri())});
    fx.agent.handle_notice(notice.to_string().as_bytes()).unwrap();

    let result = fx.agent.download("u3").await;

    // max_download_retries = 2 in the shared test config
    assert!(matches!(result, Err(UpdateError::DownloadFailed { attempts: 3, .. })));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    assert!(drain(&mut fx.events)
        .iter()
        .any(|e| matches!(e, AgentEvent::UpdateFailed { id, .. } if id == "u3")));
    assert!(!fx.agent.get("u3").unwrap().retrieved);
}

#[tokio::test]
async fn test_retrieve_in_background() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(package_bytes(64)))
        .mount(&server)
        .await;

    let fx = fixture(HashPolicy::Warn);
    let notice = json!({"id": "u4", "mpakDownloadUrl": format!("{}/u4", server.uri())});
    fx.agent.handle_notice(notice.to_string().as_bytes()).unwrap();

    let handle = fx.agent.retrieve_update("u4").unwrap();
    handle.await.unwrap();

    assert!(fx.agent.get("u4").unwrap().retrieved);
    assert!(!fx.agent.is_downloading("u4"));
    // A repeat notice for a retrieved update is ignored
    assert_eq!(
        fx.agent.handle_notice(notice.to_string().as_bytes()).unwrap(),
        NoticeOutcome::AlreadyRetrieved
    );
}

#[tokio::test]
async fn test_package_without_payload_is_not_applied() {
    let mut fx = fixture(HashPolicy::Warn);
    let notice = json!({"id": "u5", "mpakDownloadUrl": "http://127.0.0.1:9/u5"});
    fx.agent.handle_notice(notice.to_string().as_bytes()).unwrap();
    write_package(
        &fx.agent.package_path("u5"),
        &[("readme.txt", b"nothing to install")],
    );

    let result = fx.agent.apply_update("u5").await;

    assert!(matches!(result, Err(UpdateError::InvalidPackage)));
    assert_eq!(fx.platform.shutdown_count(), 0);
    assert_eq!(fx.platform.reset_count(), 0);
    assert!(drain(&mut fx.events)
        .iter()
        .any(|e| matches!(e, AgentEvent::UpdateFailed { id, .. } if id == "u5")));
}

#[tokio::test]
async fn test_apply_then_finalize_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let config = test_helpers::unauthenticated_config(&root);

    let fx = fixture_in(dir, &config.update);
    let notice = json!({"id": "u6", "osVersion": "1.0.0", "mpakDownloadUrl": "http://127.0.0.1:9/u6"});
    fx.agent.handle_notice(notice.to_string().as_bytes()).unwrap();
    write_package(
        &fx.agent.package_path("u6"),
        &[("app/bin/service", b"\x7fELF"), ("os/image.bin", b"image")],
    );

    fx.agent.apply_update("u6").await.unwrap();
    assert_eq!(fx.platform.shutdown_count(), 1);
    assert_eq!(fx.platform.reset_count(), 1);
    assert!(root.join("updates/staging/app/bin/service").exists());

    // Same data directory, fresh process
    let platform = Arc::new(MockPlatform::new("DEV1"));
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let restarted = UpdateAgent::new(
        &config.update,
        &root.join("updates"),
        platform,
        bus.clone(),
        TaskSupervisor::new(bus, CancellationToken::new()),
    )
    .unwrap();

    let applied = restarted.finalize_pending().await.unwrap().unwrap();
    assert_eq!(applied.id, "u6");
    assert!(applied.applied);
    assert!(matches!(events.try_recv(), Ok(AgentEvent::UpdateApplied(m)) if m.id == "u6"));
    assert!(restarted.finalize_pending().await.unwrap().is_none());
    drop(fx);
}

#[tokio::test]
async fn test_failed_reset_leaves_no_marker() {
    let mut fx = fixture(HashPolicy::Warn);
    fx.platform.fail_reset(true);
    let notice = json!({"id": "u7", "mpakDownloadUrl": "http://127.0.0.1:9/u7"});
    fx.agent.handle_notice(notice.to_string().as_bytes()).unwrap();
    write_package(&fx.agent.package_path("u7"), &[("app/run.sh", b"#!/bin/sh")]);

    let result = fx.agent.apply_update("u7").await;

    assert!(matches!(result, Err(UpdateError::Reset(_))));
    assert!(fx.agent.finalize_pending().await.unwrap().is_none());
    assert!(drain(&mut fx.events)
        .iter()
        .any(|e| matches!(e, AgentEvent::UpdateFailed { .. })));
}
