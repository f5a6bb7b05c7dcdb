//! Package extraction and layout checks

use super::UpdateError;
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio::task;
use tracing::debug;
use zip::ZipArchive;

/// Payload directories a package may carry
pub const PAYLOAD_DIRS: [&str; 2] = ["app", "os"];

/// Empty `staging`, creating it if needed
pub async fn reset_staging(staging: &Path) -> Result<(), UpdateError> {
    match tokio::fs::remove_dir_all(staging).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(staging).await?;
    Ok(())
}

/// Unpack a zip package into `extract_dir`; entries escaping the directory are skipped
pub async fn extract_package(zip_path: &Path, extract_dir: &Path) -> Result<usize, UpdateError> {
    let zip_path = zip_path.to_path_buf();
    let extract_dir = extract_dir.to_path_buf();

    task::spawn_blocking(move || -> Result<usize, UpdateError> {
        let file = File::open(&zip_path)?;
        let mut archive = ZipArchive::new(file)?;
        let mut extracted = 0;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let outpath = match entry.enclosed_name() {
                Some(path) => extract_dir.join(path),
                None => {
                    debug!(name = entry.name(), "Skipping unsafe archive entry");
                    continue;
                }
            };

            if entry.is_dir() {
                std::fs::create_dir_all(&outpath)?;
            } else {
                if let Some(parent) = outpath.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut outfile = File::create(&outpath)?;
                std::io::copy(&mut entry, &mut outfile)?;
                extracted += 1;
            }

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode))?;
                }
            }
        }

        Ok(extracted)
    })
    .await
    .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?
}

/// Payload directories under `staging` that exist and are non-empty
pub fn payload_dirs(staging: &Path) -> Vec<PathBuf> {
    PAYLOAD_DIRS
        .iter()
        .map(|name| staging.join(name))
        .filter(|dir| {
            std::fs::read_dir(dir)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false)
        })
        .collect()
}
