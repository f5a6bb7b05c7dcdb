//! Outbound queue capacity, ordering and forwarding behavior

mod test_helpers;

use cloudlink::connection::ConnectionState;
use cloudlink::events::EventBus;
use cloudlink::queue::{Endpoint, OutboundQueue, QueueForwarder, RecordSender};
use cloudlink::testing::MockRecordSender;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

fn ids(queue: &OutboundQueue) -> Vec<String> {
    queue
        .records()
        .into_iter()
        .map(|r| r.payload["id"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn test_overflow_keeps_newest_thirty() {
    let queue = OutboundQueue::new(30);
    for i in 1..=35 {
        queue.enqueue(json!({"id": format!("E{i}")}), Endpoint::Events);
    }

    let expected: Vec<String> = (6..=35).map(|i| format!("E{i}")).collect();
    assert_eq!(ids(&queue), expected);
    assert_eq!(queue.dropped(), 5);
}

#[test]
fn test_acknowledge_after_eviction_is_ignored() {
    let queue = OutboundQueue::new(2);
    let first = queue.enqueue(json!({"id": "a"}), Endpoint::Logs);
    queue.enqueue(json!({"id": "b"}), Endpoint::Logs);
    queue.enqueue(json!({"id": "c"}), Endpoint::Logs);

    assert!(!queue.acknowledge(first));
    assert_eq!(ids(&queue), vec!["b", "c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_respect_capacity() {
    let queue = Arc::new(OutboundQueue::new(50));
    let tasks = (0..8).map(|producer| {
        let queue = queue.clone();
        tokio::spawn(async move {
            for i in 0..100 {
                queue.enqueue(json!({"producer": producer, "i": i}), Endpoint::Logs);
            }
        })
    });
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    assert_eq!(queue.len(), 50);
    assert_eq!(queue.dropped(), 750);
    let sequences: Vec<u64> = queue.records().iter().map(|r| r.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

fn forwarder_config() -> cloudlink::config::QueueSection {
    let dir = tempfile::tempdir().unwrap();
    test_helpers::unauthenticated_config(dir.path()).queue
}

#[tokio::test]
async fn test_forwarder_waits_for_connection() {
    let queue = Arc::new(OutboundQueue::new(10));
    let sender = Arc::new(MockRecordSender::new());
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let forwarder = QueueForwarder::new(
        queue.clone(),
        sender.clone() as Arc<dyn RecordSender>,
        state_rx,
        EventBus::new(),
        &forwarder_config(),
    );
    let cancel = CancellationToken::new();
    let task = tokio::spawn(forwarder.run(cancel.clone()));

    queue.enqueue(json!({"id": "1"}), Endpoint::Logs);
    queue.enqueue(json!({"id": "2"}), Endpoint::Events);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(sender.delivered().is_empty());
    assert_eq!(queue.len(), 2);

    state_tx.send_replace(ConnectionState::Connected);
    assert!(test_helpers::eventually(|| sender.delivered().len() == 2).await);
    assert!(queue.is_empty());

    let endpoints: Vec<Endpoint> = sender.delivered().iter().map(|r| r.endpoint).collect();
    assert_eq!(endpoints, vec![Endpoint::Logs, Endpoint::Events]);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_delivery_keeps_head() {
    let queue = Arc::new(OutboundQueue::new(10));
    let sender = Arc::new(MockRecordSender::with_failure());
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
    let forwarder = QueueForwarder::new(
        queue.clone(),
        sender.clone() as Arc<dyn RecordSender>,
        state_rx,
        events,
        &forwarder_config(),
    );

    queue.enqueue(json!({"id": "head"}), Endpoint::Logs);
    let cancel = CancellationToken::new();
    assert_eq!(forwarder.drain(&cancel).await, 0);
    assert_eq!(ids(&queue), vec!["head"]);
    assert!(rx.try_recv().is_ok());

    sender.set_failure(false);
    assert_eq!(forwarder.drain(&cancel).await, 1);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_failing_delivery_is_throttled_while_producers_enqueue() {
    let queue = Arc::new(OutboundQueue::new(200));
    let sender = Arc::new(MockRecordSender::with_failure());
    let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
    let mut config = forwarder_config();
    config.throttle_delay_secs = 5;
    let forwarder = QueueForwarder::new(
        queue.clone(),
        sender.clone() as Arc<dyn RecordSender>,
        state_rx,
        EventBus::new(),
        &config,
    );
    let cancel = CancellationToken::new();
    let task = tokio::spawn(forwarder.run(cancel.clone()));

    for i in 0..100 {
        queue.enqueue(json!({"id": i.to_string()}), Endpoint::Logs);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    assert_eq!(sender.attempts(), 1);
    assert_eq!(queue.len(), 100);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

proptest! {
    #[test]
    fn prop_queue_keeps_most_recent_in_order(capacity in 1usize..40, count in 0usize..120) {
        let queue = OutboundQueue::new(capacity);
        for i in 0..count {
            queue.enqueue(json!({"n": i}), Endpoint::Logs);
        }

        let kept: Vec<u64> = queue
            .records()
            .iter()
            .map(|r| r.payload["n"].as_u64().unwrap())
            .collect();
        let start = count.saturating_sub(capacity) as u64;
        let expected: Vec<u64> = (start..count as u64).collect();

        prop_assert_eq!(kept, expected);
        prop_assert_eq!(queue.dropped(), start);
    }

    #[test]
    fn prop_dequeue_is_fifo(values in prop::collection::vec(any::<i32>(), 0..30)) {
        let queue = OutboundQueue::new(30);
        for v in &values {
            queue.enqueue(json!(v), Endpoint::Events);
        }
        let mut drained = Vec::new();
        while let Some(record) = queue.dequeue() {
            drained.push(record.payload.as_i64().unwrap() as i32);
        }
        prop_assert_eq!(drained, values);
    }
}
