//! Over-the-air updates
//!
//! Notices arrive on the ota topic, packages are downloaded with byte-range resume
//! into the data directory, verified, extracted into a staging directory and
//! applied by resetting the device. Completion is recorded on the next start.

pub mod agent;
pub mod archive;
pub mod download;
pub mod message;
pub mod store;

pub use agent::UpdateAgent;
pub use download::{Downloader, DownloadOutcome};
pub use message::{UpdateMessage, UpdateState};
pub use store::UpdateStore;

use thiserror::Error;

/// Update pipeline errors
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Unknown update id: {0}")]
    UnknownUpdate(String),

    #[error("Update {0} is already downloading")]
    AlreadyDownloading(String),

    #[error("Failed to decode update notice: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Download server returned HTTP {0}")]
    Http(u16),

    #[error("Download request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download incomplete: {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    #[error("Download failed after {attempts} attempts: {last_error}")]
    DownloadFailed { attempts: u32, last_error: String },

    #[error("Package hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Package for update {0} has not been downloaded")]
    PackageMissing(String),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Package has no app or os payload")]
    InvalidPackage,

    #[error("Device reset failed: {0}")]
    Reset(#[from] crate::platform::PlatformError),

    #[error("Update operation cancelled")]
    Cancelled,
}
