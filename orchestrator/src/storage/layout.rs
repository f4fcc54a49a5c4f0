//! Storage layout of the orchestrator's own state

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for run bookkeeping
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all state
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Advisory lock held for the duration of a run
    pub fn lock_file(&self) -> File {
        File::new(self.base_dir.join("redeploy.lock"))
    }

    /// Append-only run history, one JSON record per line
    pub fn run_log_file(&self) -> File {
        File::new(self.base_dir.join("runs.jsonl"))
    }

    /// Persisted deployment state
    pub fn state_file(&self) -> File {
        File::new(self.base_dir.join("state.json"))
    }

    /// Default snapshot directory
    pub fn backups_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("backups"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), crate::errors::DeployError> {
        Dir::new(&self.base_dir).create().await
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/var/lib/redeploy")
    }
}
