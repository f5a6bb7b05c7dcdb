//! OTA update state machine
//!
//! [`UpdateAgent`] owns the update catalogue and the staging directory. Notices
//! are recorded, downloads run in the background one per update id, and applying
//! an update stages the package, records a pending-apply marker and resets the
//! device. The marker is turned into `UpdateApplied` by [`UpdateAgent::finalize_pending`]
//! on the next start.

use super::archive::{extract_package, payload_dirs, reset_staging};
use super::download::{hash_matches, sha256_file, Downloader};
use super::{UpdateError, UpdateMessage, UpdateState, UpdateStore};
use crate::config::{HashPolicy, UpdateSection};
use crate::connection::ConnectionState;
use crate::error::{AgentResult, ErrorSource};
use crate::events::{AgentEvent, EventBus};
use crate::platform::Platform;
use crate::supervisor::TaskSupervisor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

const STAGING_DIR: &str = "staging";
const PENDING_APPLY_FILE: &str = "pending-apply.json";
/// Download progress is written to the catalogue at most this often
const PROGRESS_PERSIST_STEP: u64 = 256 * 1024;

/// What an inbound notice did to the catalogue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeOutcome {
    /// First time this id was seen
    New,
    /// Known but not downloaded yet; announced again
    Pending,
    /// Already downloaded; nothing to do
    AlreadyRetrieved,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingApply {
    id: String,
    staged_at: DateTime<Utc>,
}

pub struct UpdateAgent {
    config: UpdateSection,
    platform: Arc<dyn Platform>,
    events: EventBus,
    store: Mutex<UpdateStore>,
    downloader: Downloader,
    staging_dir: PathBuf,
    marker_path: PathBuf,
    state: watch::Sender<UpdateState>,
    active_downloads: Mutex<HashSet<String>>,
    supervisor: TaskSupervisor,
    cancel: CancellationToken,
}

/// Removes an id from the active set when the download ends, however it ends
struct ActiveDownload<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for ActiveDownload<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.id);
    }
}

impl UpdateAgent {
    /// Open the catalogue under `dir`; background downloads run on `supervisor`
    /// and stop when its token is cancelled
    pub fn new(
        config: &UpdateSection,
        dir: &Path,
        platform: Arc<dyn Platform>,
        events: EventBus,
        supervisor: TaskSupervisor,
    ) -> Result<Self, UpdateError> {
        let store = UpdateStore::open(dir)?;
        let downloader = Downloader::new(config.max_download_retries, config.download_retry_delay())?;
        let (state, _) = watch::channel(UpdateState::Dead);

        Ok(Self {
            config: config.clone(),
            platform,
            events,
            store: Mutex::new(store),
            downloader,
            staging_dir: dir.join(STAGING_DIR),
            marker_path: dir.join(PENDING_APPLY_FILE),
            state,
            active_downloads: Mutex::new(HashSet::new()),
            cancel: supervisor.cancellation_token(),
            supervisor,
        })
    }

    fn store(&self) -> MutexGuard<'_, UpdateStore> {
        self.store.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> UpdateState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<UpdateState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: UpdateState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "Update state changed");
            *current = next;
            true
        });
    }

    /// Every known update in first-seen order
    pub fn updates(&self) -> Vec<UpdateMessage> {
        self.store().all().to_vec()
    }

    pub fn get(&self, id: &str) -> Option<UpdateMessage> {
        self.store().get(id).cloned()
    }

    pub fn package_path(&self, id: &str) -> PathBuf {
        self.store().package_path(id)
    }

    pub fn is_downloading(&self, id: &str) -> bool {
        self.active_downloads
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(id)
    }

    /// Record an update notice from the ota topic
    pub fn handle_notice(&self, payload: &[u8]) -> Result<NoticeOutcome, UpdateError> {
        let notice: UpdateMessage = serde_json::from_slice(payload)?;

        let (outcome, message) = {
            let mut store = self.store();
            let existing = store.get(&notice.id).cloned();
            match existing {
                None => {
                    let fresh = UpdateMessage {
                        download_progress: 0,
                        retrieved: false,
                        applied: false,
                        ..notice
                    };
                    store.upsert(fresh.clone())?;
                    (NoticeOutcome::New, fresh)
                }
                Some(existing) if existing.retrieved => (NoticeOutcome::AlreadyRetrieved, existing),
                Some(_) => {
                    let merged = store.update(&notice.id, |m| m.merge_notice(&notice))?;
                    (NoticeOutcome::Pending, merged)
                }
            }
        };

        match outcome {
            NoticeOutcome::AlreadyRetrieved => {
                debug!(update_id = %message.id, "Update already retrieved, ignoring notice");
            }
            _ => {
                info!(update_id = %message.id, os_version = %message.os_version, "Update available");
                self.events.emit(AgentEvent::UpdateAvailable(message));
            }
        }
        Ok(outcome)
    }

    /// Start downloading `id` in the background
    pub fn retrieve_update(self: &Arc<Self>, id: &str) -> Result<JoinHandle<()>, UpdateError> {
        if !self.store().contains(id) {
            return Err(UpdateError::UnknownUpdate(id.to_string()));
        }
        if self.is_downloading(id) {
            return Err(UpdateError::AlreadyDownloading(id.to_string()));
        }

        let agent = self.clone();
        let id = id.to_string();
        Ok(self.supervisor.spawn_tracked("update_download", async move {
            // Failures already went out as UpdateFailed
            if let Err(e) = agent.download(&id).await {
                debug!(update_id = %id, error = %e, "Background download ended with error");
            }
            Ok(())
        }))
    }

    /// Download, verify and mark an update retrieved
    ///
    /// Failures are also raised as `UpdateFailed` events.
    pub async fn download(&self, id: &str) -> Result<UpdateMessage, UpdateError> {
        let _active = {
            let mut set = self
                .active_downloads
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if !set.insert(id.to_string()) {
                return Err(UpdateError::AlreadyDownloading(id.to_string()));
            }
            ActiveDownload {
                set: &self.active_downloads,
                id: id.to_string(),
            }
        };

        let span = crate::update_span!(id, "download");
        let result = self.download_inner(id).instrument(span).await;

        match &result {
            Ok(_) => {}
            Err(UpdateError::Cancelled) => info!(update_id = %id, "Download cancelled"),
            Err(e) => self.report_failure(id, e),
        }
        self.set_state(UpdateState::Idle);
        result
    }

    async fn download_inner(&self, id: &str) -> Result<UpdateMessage, UpdateError> {
        let (message, path) = {
            let store = self.store();
            let message = store
                .get(id)
                .cloned()
                .ok_or_else(|| UpdateError::UnknownUpdate(id.to_string()))?;
            (message, store.package_path(id))
        };
        if message.retrieved && path.exists() {
            debug!("Package already retrieved");
            return Ok(message);
        }

        self.set_state(UpdateState::DownloadingFile);
        let local_os = self.platform.os_version();
        let url = message.download_url_for(&local_os).to_string();
        info!(url = %url, resume_from = message.download_progress, "Downloading update package");

        let mut persisted = message.download_progress;
        let outcome = self
            .downloader
            .fetch(&url, &path, message.download_size, &self.cancel, |done, total| {
                self.events.emit(AgentEvent::UpdateProgress {
                    id: id.to_string(),
                    downloaded_bytes: done,
                    total_bytes: total,
                });
                if done < persisted || done - persisted >= PROGRESS_PERSIST_STEP {
                    persisted = done;
                    if let Err(e) = self.store().update(id, |m| m.download_progress = done) {
                        warn!(error = %e, "Could not persist download progress");
                    }
                }
            })
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let on_disk = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                if let Err(persist) = self.store().update(id, |m| m.download_progress = on_disk) {
                    warn!(error = %persist, "Could not persist download progress");
                }
                return Err(e);
            }
        };

        let actual = sha256_file(&path).await?;
        if hash_matches(message.hash.as_deref(), &actual) == Some(false) {
            let expected = message.hash.clone().unwrap_or_default();
            match self.config.hash_policy {
                HashPolicy::Warn => {
                    warn!(expected = %expected, actual = %actual, "Package hash mismatch");
                }
                HashPolicy::Enforce => {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(error = %e, "Could not remove rejected package");
                    }
                    self.store().update(id, |m| {
                        m.download_progress = 0;
                        m.retrieved = false;
                    })?;
                    return Err(UpdateError::HashMismatch { expected, actual });
                }
            }
        }

        let updated = self.store().update(id, |m| {
            m.download_progress = outcome.bytes;
            m.retrieved = true;
        })?;
        info!(bytes = outcome.bytes, attempts = outcome.attempts, "Update retrieved");
        self.events.emit(AgentEvent::UpdateRetrieved(updated.clone()));
        Ok(updated)
    }

    /// Stage a retrieved package and reset the device into it
    ///
    /// A package without an `app` or `os` payload raises `UpdateFailed` and the
    /// device is left running.
    pub async fn apply_update(&self, id: &str) -> Result<(), UpdateError> {
        let path = {
            let store = self.store();
            if !store.contains(id) {
                return Err(UpdateError::UnknownUpdate(id.to_string()));
            }
            store.package_path(id)
        };
        if !path.exists() {
            return Err(UpdateError::PackageMissing(id.to_string()));
        }

        let span = crate::update_span!(id, "apply");
        let result = self.apply_inner(id, &path).instrument(span).await;
        if let Err(e) = &result {
            self.report_failure(id, e);
            self.set_state(UpdateState::Idle);
        }
        result
    }

    async fn apply_inner(&self, id: &str, package: &Path) -> Result<(), UpdateError> {
        self.set_state(UpdateState::UpdateInProgress);

        reset_staging(&self.staging_dir).await?;
        let extracted = extract_package(package, &self.staging_dir).await?;
        let payloads = payload_dirs(&self.staging_dir);
        if payloads.is_empty() {
            warn!(extracted, "Package carries neither app nor os payload");
            return Err(UpdateError::InvalidPackage);
        }
        info!(extracted, payloads = ?payloads, "Package staged");

        let marker = PendingApply {
            id: id.to_string(),
            staged_at: Utc::now(),
        };
        tokio::fs::write(&self.marker_path, serde_json::to_vec(&marker)?).await?;

        let timeout = self.config.shutdown_timeout();
        if tokio::time::timeout(timeout, self.platform.request_shutdown())
            .await
            .is_err()
        {
            warn!(timeout_secs = timeout.as_secs(), "Host shutdown timed out, resetting anyway");
        }

        info!("Resetting device to apply update");
        if let Err(e) = self.platform.reset_device().await {
            if let Err(remove) = tokio::fs::remove_file(&self.marker_path).await {
                warn!(error = %remove, "Could not remove pending-apply marker");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Complete an apply interrupted by the reset; call once at start
    pub async fn finalize_pending(&self) -> Result<Option<UpdateMessage>, UpdateError> {
        let bytes = match tokio::fs::read(&self.marker_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        tokio::fs::remove_file(&self.marker_path).await?;

        let marker: PendingApply = match serde_json::from_slice(&bytes) {
            Ok(marker) => marker,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable pending-apply marker");
                return Ok(None);
            }
        };

        let applied = match self.store().update(&marker.id, |m| m.applied = true) {
            Ok(message) => message,
            Err(UpdateError::UnknownUpdate(id)) => {
                warn!(update_id = %id, "Pending-apply marker names an unknown update");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        info!(update_id = %applied.id, staged_at = %marker.staged_at, "Update applied");
        self.events.emit(AgentEvent::UpdateApplied(applied.clone()));
        Ok(Some(applied))
    }

    /// Forget every update and delete downloaded packages
    pub fn clear_updates(&self) -> Result<usize, UpdateError> {
        let removed = self.store().clear()?;
        info!(removed, "Update catalogue cleared");
        Ok(removed)
    }

    fn report_failure(&self, id: &str, error: &UpdateError) {
        warn!(update_id = %id, error = %error, "Update failed");
        self.events.emit(AgentEvent::UpdateFailed {
            id: id.to_string(),
            reason: error.to_string(),
        });
        self.events.error(ErrorSource::Update, error);
    }

    /// Mirror the connection state while no update work is running
    fn mirror_connection(&self, connection: ConnectionState) {
        let next = if connection == ConnectionState::Connected {
            UpdateState::Connected
        } else {
            UpdateState::Disconnected
        };
        self.state.send_if_modified(|current| {
            let busy = matches!(
                current,
                UpdateState::DownloadingFile | UpdateState::UpdateInProgress
            );
            if busy || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Follow the connection until cancelled
    pub async fn run(
        self: Arc<Self>,
        mut connection: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) -> AgentResult<()> {
        self.set_state(UpdateState::Idle);
        let current = *connection.borrow_and_update();
        self.mirror_connection(current);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *connection.borrow_and_update();
                    self.mirror_connection(current);
                }
            }
        }

        self.set_state(UpdateState::Dead);
        info!("Update agent stopped");
        Ok(())
    }
}
