//! Bounded outbound record queue
//!
//! Telemetry and log records wait here until the forwarder can deliver them. The
//! queue is lossy on purpose: when it's over capacity the oldest records go first,
//! so a long disconnection can't grow memory without bound.

pub mod forwarder;
pub mod records;
pub mod sender;

pub use forwarder::QueueForwarder;
pub use records::{EventRecord, LogRecord, Severity};
pub use sender::{HttpRecordSender, RecordSender};

use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 30;

/// Cloud endpoint a record is posted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Logs,
    Events,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Logs => "/api/logs",
            Endpoint::Events => "/api/events",
        }
    }
}

/// A record waiting for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRecord {
    pub payload: Value,
    pub endpoint: Endpoint,
    /// Monotonic enqueue position
    pub sequence: u64,
}

/// Record delivery failures; the record stays at the head of the queue
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("No bearer token available")]
    NotAuthenticated,
    #[error("Delivery rejected with HTTP {status}")]
    Rejected { status: u16 },
    #[error("Delivery request failed")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Record serialization failed")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct QueueInner {
    records: VecDeque<QueuedRecord>,
    next_sequence: u64,
    dropped: u64,
}

/// Bounded FIFO with a wake signal for its consumer
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Append a record, evicting from the front while over capacity
    ///
    /// Returns the record's sequence number.
    pub fn enqueue(&self, payload: Value, endpoint: Endpoint) -> u64 {
        let sequence = {
            let mut inner = self.lock();
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            inner.records.push_back(QueuedRecord {
                payload,
                endpoint,
                sequence,
            });

            while inner.records.len() > self.capacity {
                if let Some(evicted) = inner.records.pop_front() {
                    inner.dropped += 1;
                    warn!(
                        sequence = evicted.sequence,
                        capacity = self.capacity,
                        "Outbound queue full, dropped oldest record"
                    );
                }
            }
            sequence
        };

        debug!(sequence, endpoint = ?endpoint, "Record enqueued");
        self.notify.notify_one();
        sequence
    }

    /// Serialize and enqueue any record type
    pub fn enqueue_serialized<T: Serialize>(
        &self,
        record: &T,
        endpoint: Endpoint,
    ) -> Result<u64, DeliveryError> {
        Ok(self.enqueue(serde_json::to_value(record)?, endpoint))
    }

    pub fn enqueue_log(&self, record: &LogRecord) -> Result<u64, DeliveryError> {
        self.enqueue_serialized(record, Endpoint::Logs)
    }

    pub fn enqueue_event(&self, record: &EventRecord) -> Result<u64, DeliveryError> {
        self.enqueue_serialized(record, Endpoint::Events)
    }

    pub fn peek(&self) -> Option<QueuedRecord> {
        self.lock().records.front().cloned()
    }

    pub fn dequeue(&self) -> Option<QueuedRecord> {
        self.lock().records.pop_front()
    }

    /// Remove the head only if it is still the record that was delivered
    ///
    /// The head can be evicted while its delivery is in flight; in that case there
    /// is nothing to remove.
    pub fn acknowledge(&self, sequence: u64) -> bool {
        let mut inner = self.lock();
        match inner.records.front() {
            Some(head) if head.sequence == sequence => {
                inner.records.pop_front();
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records evicted since creation
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn clear(&self) {
        self.lock().records.clear();
    }

    /// Snapshot of queued records, head first
    pub fn records(&self) -> Vec<QueuedRecord> {
        self.lock().records.iter().cloned().collect()
    }

    /// Resolves after the next enqueue, or at once if one happened since the last wait
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
