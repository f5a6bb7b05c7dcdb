//! Crash marker forwarding

use crate::queue::{LogRecord, OutboundQueue, Severity};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sends crash markers left by the hosting runtime as fatal log records
pub struct CrashReporter {
    device_id: String,
    paths: Vec<PathBuf>,
    queue: Arc<OutboundQueue>,
}

impl CrashReporter {
    pub fn new(device_id: &str, paths: Vec<PathBuf>, queue: Arc<OutboundQueue>) -> Self {
        Self {
            device_id: device_id.to_string(),
            paths,
            queue,
        }
    }

    /// Queue every present marker and delete it; returns how many were queued
    ///
    /// A failure on one file is logged and the rest are still processed.
    pub async fn flush(&self) -> usize {
        let mut sent = 0;
        for path in &self.paths {
            match self.forward(path).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Could not forward crash report"),
            }
        }
        sent
    }

    async fn forward(&self, path: &Path) -> std::io::Result<bool> {
        let content = match tokio::fs::read(path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No crash marker");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let record = LogRecord::new(
            &self.device_id,
            Severity::Fatal,
            format!("Crash report {}", path.display()),
        )
        .with_exception(content);
        self.queue
            .enqueue_log(&record)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;

        tokio::fs::remove_file(path).await?;
        info!(path = %path.display(), "Crash report queued");
        Ok(true)
    }
}
