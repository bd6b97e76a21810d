//! Durable iteration state

use super::error::StateError;
use super::types::IterationState;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persistence for `IterationState`
pub trait IterationStateStore: Send + Sync {
    /// `Ok(None)` when no state has ever been saved
    fn load(&self) -> Result<Option<IterationState>, StateError>;

    fn save(&self, state: &IterationState) -> Result<(), StateError>;
}

/// JSON file store; writes go to a temp file that is synced and renamed
/// over the target, so a crash leaves either the old or the new state.
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl IterationStateStore for JsonFileStateStore {
    fn load(&self) -> Result<Option<IterationState>, StateError> {
        if !self.path.exists() {
            log::info!("No existing iteration state found: {}", self.path.display());
            return Ok(None);
        }

        let json = fs::read_to_string(&self.path)?;
        let state: IterationState = serde_json::from_str(&json)?;

        log::info!(
            "Loaded iteration state from {}: iteration={}, since_flush={}",
            self.path.display(),
            state.iteration,
            state.iterations_since_flush
        );
        Ok(Some(state))
    }

    fn save(&self, state: &IterationState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.tmp_path();

        {
            let mut file = File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        log::debug!(
            "Saved iteration state: iteration={}, since_flush={}",
            state.iteration,
            state.iterations_since_flush
        );
        Ok(())
    }
}
