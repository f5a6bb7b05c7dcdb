//! Update notices and the update agent's state

use serde::{Deserialize, Serialize};
use std::fmt;

/// One OTA update as announced by the cloud, plus local progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    #[serde(alias = "mpakId", alias = "MpakID", alias = "Id")]
    pub id: String,
    /// OS version the app-only package was built against
    #[serde(default, alias = "version", alias = "Version", alias = "OsVersion")]
    pub os_version: String,
    #[serde(alias = "MpakDownloadUrl")]
    pub mpak_download_url: String,
    /// Package bundling the app with a matching OS image
    #[serde(default, alias = "MpakWithOsDownloadUrl")]
    pub mpak_with_os_download_url: Option<String>,
    /// Expected SHA-256 of the package, hex encoded
    #[serde(default, alias = "crc", alias = "Crc", alias = "sha256")]
    pub hash: Option<String>,
    #[serde(default, alias = "DownloadSize")]
    pub download_size: Option<u64>,
    #[serde(default, alias = "Summary")]
    pub summary: Option<String>,
    #[serde(default, alias = "PublishedOn")]
    pub published_on: Option<String>,

    /// Bytes written to the local package file
    #[serde(default)]
    pub download_progress: u64,
    #[serde(default)]
    pub retrieved: bool,
    #[serde(default)]
    pub applied: bool,
}

impl UpdateMessage {
    pub fn new(id: impl Into<String>, os_version: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            os_version: os_version.into(),
            mpak_download_url: url.into(),
            mpak_with_os_download_url: None,
            hash: None,
            download_size: None,
            summary: None,
            published_on: None,
            download_progress: 0,
            retrieved: false,
            applied: false,
        }
    }

    /// App-only package when the running OS already matches, otherwise the OS bundle
    pub fn download_url_for(&self, local_os_version: &str) -> &str {
        if self.os_version.is_empty() || self.os_version == local_os_version {
            &self.mpak_download_url
        } else {
            self.mpak_with_os_download_url
                .as_deref()
                .unwrap_or(&self.mpak_download_url)
        }
    }

    /// Copy cloud-provided fields from a newer notice, keeping local progress
    pub fn merge_notice(&mut self, notice: &UpdateMessage) {
        self.os_version = notice.os_version.clone();
        self.mpak_download_url = notice.mpak_download_url.clone();
        self.mpak_with_os_download_url = notice.mpak_with_os_download_url.clone();
        self.hash = notice.hash.clone();
        self.download_size = notice.download_size;
        self.summary = notice.summary.clone();
        self.published_on = notice.published_on.clone();
    }
}

/// Update agent lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateState {
    /// Not started
    Dead,
    Disconnected,
    Idle,
    Connected,
    DownloadingFile,
    UpdateInProgress,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateState::Dead => "dead",
            UpdateState::Disconnected => "disconnected",
            UpdateState::Idle => "idle",
            UpdateState::Connected => "connected",
            UpdateState::DownloadingFile => "downloading_file",
            UpdateState::UpdateInProgress => "update_in_progress",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_cloud_notice() {
        let json = r#"{
            "MpakID": "upd-42",
            "Version": "2.1.0",
            "MpakDownloadUrl": "https://cdn.example.com/app.mpak",
            "MpakWithOsDownloadUrl": "https://cdn.example.com/app-os.mpak",
            "DownloadSize": 1024,
            "Summary": "Bug fixes"
        }"#;
        let msg: UpdateMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, "upd-42");
        assert_eq!(msg.os_version, "2.1.0");
        assert_eq!(msg.download_size, Some(1024));
        assert_eq!(msg.download_progress, 0);
        assert!(!msg.retrieved && !msg.applied);
    }

    #[test]
    fn test_url_selection() {
        let mut msg = UpdateMessage::new("u1", "2.0", "https://x/app.mpak");
        msg.mpak_with_os_download_url = Some("https://x/app-os.mpak".to_string());

        assert_eq!(msg.download_url_for("2.0"), "https://x/app.mpak");
        assert_eq!(msg.download_url_for("1.9"), "https://x/app-os.mpak");

        msg.mpak_with_os_download_url = None;
        assert_eq!(msg.download_url_for("1.9"), "https://x/app.mpak");
    }

    #[test]
    fn test_merge_notice_keeps_progress() {
        let mut stored = UpdateMessage::new("u1", "2.0", "https://x/old.mpak");
        stored.download_progress = 500;
        stored.retrieved = true;

        let notice = UpdateMessage::new("u1", "2.0", "https://x/new.mpak");
        stored.merge_notice(&notice);

        assert_eq!(stored.mpak_download_url, "https://x/new.mpak");
        assert_eq!(stored.download_progress, 500);
        assert!(stored.retrieved);
    }
}
