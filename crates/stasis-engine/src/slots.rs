use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use stasis_store::RecordStore;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};

/// Default extension of save files.
pub const DEFAULT_EXTENSION: &str = "sav";

/// A save file found in a slot directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotEntry {
    pub name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
}

/// Maps slot names to save files in one directory.
///
/// Versioned saves append a UTC timestamp to the slot name, so repeated
/// saves grow the directory instead of overwriting one file.
#[derive(Clone, Debug)]
pub struct SaveSlots {
    root: PathBuf,
    extension: String,
}

impl SaveSlots {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reduce a slot name to `[A-Za-z0-9_-]`, mapping anything else to `_`.
    pub fn sanitize(name: &str) -> EngineResult<String> {
        let cleaned: String = name
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if cleaned.is_empty() {
            return Err(EngineError::Slot(format!("invalid slot name {name:?}")));
        }
        Ok(cleaned)
    }

    /// Path of the unversioned file for `name`.
    pub fn slot_path(&self, name: &str) -> EngineResult<PathBuf> {
        let name = Self::sanitize(name)?;
        Ok(self.root.join(format!("{name}.{}", self.extension)))
    }

    /// Path of a versioned file for `name` stamped with `at`.
    pub fn versioned_path(&self, name: &str, at: DateTime<Utc>) -> EngineResult<PathBuf> {
        let name = Self::sanitize(name)?;
        let stamp = at.format("%Y%m%d-%H%M%S%3f");
        Ok(self.root.join(format!("{name}_{stamp}.{}", self.extension)))
    }

    /// Every save file in the directory, newest first.
    pub fn list(&self) -> EngineResult<Vec<SlotEntry>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(slot_io(&self.root, e)),
        };

        let mut slots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| slot_io(&self.root, e))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(self.extension.as_str()) {
                continue;
            }
            let meta = entry.metadata().map_err(|e| slot_io(&path, e))?;
            if !meta.is_file() {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            slots.push(SlotEntry {
                name: name.to_string(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: meta.len(),
                path,
            });
        }
        slots.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
        debug!(root = %self.root.display(), count = slots.len(), "save slots listed");
        Ok(slots)
    }

    /// Copy the records of `store` into a new versioned file for `name`.
    /// Returns the new file's path.
    pub async fn seed_version(&self, store: &RecordStore, name: &str) -> EngineResult<PathBuf> {
        let path = self.versioned_path(name, Utc::now())?;
        let copied = store.copy_to(&path).await?;
        info!(path = %path.display(), records = copied, "versioned save seeded");
        Ok(path)
    }
}

fn slot_io(path: &Path, error: io::Error) -> EngineError {
    EngineError::Slot(format!("{}: {error}", path.display()))
}
