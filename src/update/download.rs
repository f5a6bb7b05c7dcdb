//! Resumable package download and integrity check
//!
//! The partially written file on disk is the source of truth for the resume
//! offset. Each attempt asks for `Range: bytes=<len>-` and appends; a server that
//! ignores the range answers 200 and the file is restarted from zero.

use super::UpdateError;
use crate::supervisor::cancellable_sleep;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a finished download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub bytes: u64,
    pub attempts: u32,
}

/// HTTP downloader with a fixed retry budget
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl Downloader {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            max_retries,
            retry_delay,
        })
    }

    /// Download `url` into `path`, resuming whatever is already there
    ///
    /// `on_progress` sees the bytes on disk and the total size when known. Every
    /// failure is retried up to `max_retries` times after `retry_delay`, keeping
    /// the bytes already written.
    pub async fn fetch<F>(
        &self,
        url: &str,
        path: &Path,
        expected_size: Option<u64>,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<DownloadOutcome, UpdateError>
    where
        F: FnMut(u64, Option<u64>),
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .attempt(url, path, expected_size, cancel, &mut on_progress)
                .await
            {
                Ok(bytes) => {
                    info!(bytes, attempts, "Download complete");
                    return Ok(DownloadOutcome { bytes, attempts });
                }
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(e) if attempts <= self.max_retries => {
                    warn!(
                        attempt = attempts,
                        max_retries = self.max_retries,
                        error = %e,
                        "Download attempt failed, retrying"
                    );
                    if !cancellable_sleep(cancel, self.retry_delay).await {
                        return Err(UpdateError::Cancelled);
                    }
                }
                Err(e) => {
                    return Err(UpdateError::DownloadFailed {
                        attempts,
                        last_error: e.to_string(),
                    })
                }
            }
        }
    }

    async fn attempt<F>(
        &self,
        url: &str,
        path: &Path,
        expected_size: Option<u64>,
        cancel: &CancellationToken,
        on_progress: &mut F,
    ) -> Result<u64, UpdateError>
    where
        F: FnMut(u64, Option<u64>),
    {
        let mut offset = existing_length(path).await?;

        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        debug!(url, offset, "Requesting package");

        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => {
                if offset > 0 {
                    info!(offset, "Server ignored range request, restarting download");
                    offset = 0;
                }
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                debug!(offset, "Nothing left to fetch");
                return Ok(offset);
            }
            other => return Err(UpdateError::Http(other.as_u16())),
        }

        let total = content_range_total(response.headers())
            .or_else(|| response.content_length().map(|len| len + offset))
            .or(expected_size);

        let mut file = if offset == 0 {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .await?
        } else {
            OpenOptions::new().append(true).open(path).await?
        };

        let mut written = offset;
        on_progress(written, total);
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    return Err(UpdateError::Cancelled);
                }
                chunk = response.chunk() => chunk?,
            };
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            on_progress(written, total);
        }
        file.flush().await?;

        match total {
            Some(expected) if written < expected => Err(UpdateError::Incomplete {
                received: written,
                expected,
            }),
            _ => Ok(written),
        }
    }
}

async fn existing_length(path: &Path) -> Result<u64, UpdateError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Total size from `Content-Range: bytes <start>-<end>/<total>`
fn content_range_total(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Hex SHA-256 of a file, hashed off the async runtime
pub async fn sha256_file(path: &Path) -> Result<String, UpdateError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String, UpdateError> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?
}

/// Compare against an advertised hash
///
/// Returns `None` when there is nothing usable to compare with.
pub fn hash_matches(expected: Option<&str>, actual: &str) -> Option<bool> {
    let expected = expected?.trim();
    if expected.len() != 64 || !expected.chars().all(|c| c.is_ascii_hexdigit()) {
        if !expected.is_empty() {
            warn!(expected, "Advertised hash is not a SHA-256 digest, skipping check");
        }
        return None;
    }
    Some(expected.eq_ignore_ascii_case(actual))
}
