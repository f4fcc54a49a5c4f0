//! Advisory run lock

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::errors::DeployError;

/// Exclusive advisory lock held for the whole run.
///
/// Released when dropped (or when the process exits).
#[derive(Debug)]
pub struct RunLock {
    file: fs::File,
    path: PathBuf,
}

impl RunLock {
    /// Try to take the lock without waiting.
    ///
    /// Contention yields [`DeployError::AlreadyRunning`].
    pub fn acquire(path: &Path) -> Result<Self, DeployError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(DeployError::AlreadyRunning(path.to_path_buf()));
            }
            return Err(e.into());
        }

        // Holder pid, for operators inspecting a stuck lock
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        debug!("Acquired run lock {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release run lock {}: {}", self.path.display(), e);
        }
    }
}
