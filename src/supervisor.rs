//! Supervised background tasks
//!
//! Every long-running loop is spawned through [`TaskSupervisor`]. A task that returns an
//! error or panics is reported on the event channel instead of disappearing silently.
//! Short-lived work started on demand (downloads, health sends) goes through
//! [`TaskSupervisor::spawn_tracked`] so shutdown can wait for it.

use crate::error::{AgentResult, ErrorSource};
use crate::events::EventBus;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Spawns tasks bound to a shared cancellation token
#[derive(Debug, Clone)]
pub struct TaskSupervisor {
    events: EventBus,
    cancel: CancellationToken,
    in_flight: Arc<watch::Sender<usize>>,
}

/// Counts one tracked task; released when the task's future is dropped
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl TaskSupervisor {
    pub fn new(events: EventBus, cancel: CancellationToken) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            events,
            cancel,
            in_flight: Arc::new(in_flight),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a named task; its failure or panic becomes an `ErrorOccurred` event
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = AgentResult<()>> + Send + 'static,
    {
        let events = self.events.clone();
        let inner = tokio::spawn(task);

        tokio::spawn(async move {
            match inner.await {
                Ok(Ok(())) => {
                    debug!(task = name, "Background task finished");
                }
                Ok(Err(e)) => {
                    error!(task = name, error = %e, "Background task failed");
                    events.emit(crate::events::AgentEvent::ErrorOccurred(e.to_error_event()));
                }
                Err(join_error) if join_error.is_cancelled() => {
                    warn!(task = name, "Background task was cancelled");
                }
                Err(join_error) => {
                    error!(task = name, error = %join_error, "Background task panicked");
                    events.error(
                        ErrorSource::Supervisor,
                        format!("task {name} panicked: {join_error}"),
                    );
                }
            }
        })
    }

    /// Like [`spawn`](Self::spawn), and counted until the task ends
    pub fn spawn_tracked<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = AgentResult<()>> + Send + 'static,
    {
        let guard = InFlight::enter(&self.in_flight);
        self.spawn(name, async move {
            let _guard = guard;
            task.await
        })
    }

    /// Tracked tasks still running
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait up to `grace` for every tracked task to end; `false` on timeout
    pub async fn wait_tracked(&self, grace: Duration) -> bool {
        let mut rx = self.in_flight.subscribe();
        let done = matches!(
            tokio::time::timeout(grace, rx.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        done
    }

    /// Request cancellation of every supervised task
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Sleep that ends early when `cancel` fires
///
/// Returns `true` if the full delay elapsed, `false` if cancellation was requested.
pub async fn cancellable_sleep(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
