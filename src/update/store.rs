//! Persistent update catalogue
//!
//! A JSON array of [`UpdateMessage`] in `catalog.json`, rewritten atomically on
//! every change. Entries keep their first-seen order.

use super::{UpdateError, UpdateMessage};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CATALOG_FILE: &str = "catalog.json";
const PACKAGE_EXTENSION: &str = "mpak";

#[derive(Debug)]
pub struct UpdateStore {
    dir: PathBuf,
    entries: Vec<UpdateMessage>,
}

impl UpdateStore {
    /// Open the catalogue in `dir`, creating the directory if needed
    ///
    /// An unreadable catalogue is logged and replaced by an empty one.
    pub fn open(dir: &Path) -> Result<Self, UpdateError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(CATALOG_FILE);

        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<UpdateMessage>>(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Update catalogue corrupt, starting empty");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(count = entries.len(), "Update catalogue loaded");
        Ok(Self {
            dir: dir.to_path_buf(),
            entries,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, id: &str) -> Option<&UpdateMessage> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn all(&self) -> &[UpdateMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a new id or replace the existing entry in place; returns `true` when new
    pub fn upsert(&mut self, message: UpdateMessage) -> Result<bool, UpdateError> {
        let inserted = match self.entries.iter_mut().find(|e| e.id == message.id) {
            Some(existing) => {
                *existing = message;
                false
            }
            None => {
                self.entries.push(message);
                true
            }
        };
        self.save()?;
        Ok(inserted)
    }

    /// Mutate one entry and persist; returns the updated copy
    pub fn update<F>(&mut self, id: &str, mutate: F) -> Result<UpdateMessage, UpdateError>
    where
        F: FnOnce(&mut UpdateMessage),
    {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| UpdateError::UnknownUpdate(id.to_string()))?;
        mutate(entry);
        let updated = entry.clone();
        self.save()?;
        Ok(updated)
    }

    /// Forget every entry and delete downloaded packages
    pub fn clear(&mut self) -> Result<usize, UpdateError> {
        let removed = self.entries.len();
        for entry in &self.entries {
            let package = self.package_path(&entry.id);
            match std::fs::remove_file(&package) {
                Ok(()) => debug!(path = %package.display(), "Removed package"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %package.display(), error = %e, "Could not remove package"),
            }
        }
        self.entries.clear();
        self.save()?;
        Ok(removed)
    }

    /// Where the package for `id` is downloaded to
    ///
    /// Ids that need characters replaced get a digest of the raw id appended, so
    /// `a/b` and `a_b` never share a file.
    pub fn package_path(&self, id: &str) -> PathBuf {
        let safe: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if safe == id {
            return self.dir.join(format!("{safe}.{PACKAGE_EXTENSION}"));
        }
        let digest = hex::encode(Sha256::digest(id.as_bytes()));
        self.dir
            .join(format!("{safe}-{}.{PACKAGE_EXTENSION}", &digest[..12]))
    }

    fn save(&self) -> Result<(), UpdateError> {
        let path = self.dir.join(CATALOG_FILE);
        let tmp = self.dir.join(format!("{CATALOG_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(&self.entries)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}
