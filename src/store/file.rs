//! JSON file repository with write-then-rename commits.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::repository::{PersistedState, Repository};
use crate::error::{Result, RouteguardError};

/// Persists the whole state as one JSON document.
///
/// A commit writes a sibling temporary file, syncs it, and renames it over
/// the target, so a crash leaves either the old or the new document.
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    path: PathBuf,
}

impl JsonFileRepository {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Repository for JsonFileRepository {
    fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No stored state, starting empty");
            return Ok(PersistedState::default());
        }

        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(PersistedState::default());
        }
        serde_json::from_str(&contents).map_err(|e| {
            RouteguardError::MalformedState(format!("{}: {}", self.path.display(), e))
        })
    }

    fn commit(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.temp_path();
        let bytes = serde_json::to_vec_pretty(state)?;
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        debug!(
            path = %self.path.display(),
            endpoints = state.endpoints.len(),
            snapshots = state.snapshots.len(),
            "State committed"
        );
        Ok(())
    }
}
