//! Directory operations

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::errors::DeployError;
use crate::filesys::file::File;

/// How a tree copy reacts to individual entry failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// The first failure aborts the copy
    Strict,

    /// Failures are logged and collected; the copy continues
    BestEffort,
}

/// Outcome of a tree copy
#[derive(Debug, Clone, Default)]
pub struct CopyReport {
    /// Regular files copied
    pub files: u64,

    /// Bytes copied
    pub bytes: u64,

    /// Entries that could not be copied (best-effort mode only)
    pub failures: Vec<(PathBuf, String)>,
}

impl CopyReport {
    fn record(&mut self, mode: CopyMode, path: &Path, err: io::Error) -> Result<(), DeployError> {
        match mode {
            CopyMode::Strict => Err(DeployError::IoError(io::Error::new(
                err.kind(),
                format!("{}: {}", path.display(), err),
            ))),
            CopyMode::BestEffort => {
                warn!("Failed to copy {}: {}", path.display(), err);
                self.failures.push((path.to_path_buf(), err.to_string()));
                Ok(())
            }
        }
    }
}

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), DeployError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), DeployError> {
        if self.exists().await {
            fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }

    /// Move the directory to `to` with a single rename
    pub async fn rename(&self, to: &Path) -> Result<Dir, DeployError> {
        fs::rename(&self.path, to).await?;
        Ok(Dir::new(to))
    }

    /// List subdirectories
    pub async fn list_dirs(&self) -> Result<Vec<PathBuf>, DeployError> {
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }

        dirs.sort();
        Ok(dirs)
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }

    /// Total size in bytes of regular files under this directory.
    /// Symlinks are not followed.
    pub async fn tree_size(&self) -> Result<u64, DeployError> {
        let mut total = 0u64;
        let mut pending = vec![self.path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = fs::symlink_metadata(entry.path()).await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else if meta.is_file() {
                    total += meta.len();
                }
            }
        }

        Ok(total)
    }

    /// Recursively copy the contents of this directory into `dest`.
    ///
    /// Regular files keep their permission bits, symlinks are recreated as
    /// symlinks, and other special files are skipped. Existing files in
    /// `dest` are overwritten; extra files in `dest` are left alone.
    pub async fn copy_tree(&self, dest: &Dir, mode: CopyMode) -> Result<CopyReport, DeployError> {
        let mut report = CopyReport::default();
        fs::create_dir_all(dest.path()).await?;
        if let Ok(meta) = fs::metadata(&self.path).await {
            let _ = fs::set_permissions(dest.path(), meta.permissions()).await;
        }

        let mut pending = vec![(self.path.clone(), dest.path.clone())];
        while let Some((from, to)) = pending.pop() {
            let mut entries = match fs::read_dir(&from).await {
                Ok(entries) => entries,
                Err(e) => {
                    report.record(mode, &from, e)?;
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        report.record(mode, &from, e)?;
                        break;
                    }
                };

                let src = entry.path();
                let dst = to.join(entry.file_name());
                let result = match fs::symlink_metadata(&src).await {
                    Ok(meta) if meta.is_dir() => copy_dir_entry(&dst, meta.permissions())
                        .await
                        .map(|_| pending.push((src.clone(), dst))),
                    Ok(meta) if meta.file_type().is_symlink() => copy_symlink(&src, &dst).await,
                    Ok(meta) if meta.is_file() => fs::copy(&src, &dst).await.map(|bytes| {
                        report.files += 1;
                        report.bytes += bytes;
                    }),
                    Ok(_) => {
                        debug!("Skipping special file {}", src.display());
                        Ok(())
                    }
                    Err(e) => Err(e),
                };

                if let Err(e) = result {
                    report.record(mode, &src, e)?;
                }
            }
        }

        Ok(report)
    }
}

async fn copy_dir_entry(dst: &Path, permissions: std::fs::Permissions) -> io::Result<()> {
    fs::create_dir_all(dst).await?;
    fs::set_permissions(dst, permissions).await
}

async fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let target = fs::read_link(src).await?;
    if fs::symlink_metadata(dst).await.is_ok() {
        fs::remove_file(dst).await?;
    }

    #[cfg(unix)]
    {
        fs::symlink(target, dst).await
    }

    #[cfg(not(unix))]
    {
        let _ = target;
        fs::copy(src, dst).await.map(|_| ())
    }
}
