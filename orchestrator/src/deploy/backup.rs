//! Snapshot backups of the live deployment directory
//!
//! Layout under the backups directory:
//!
//! ```text
//! latest/            newest snapshot (tree/ + meta.json)
//! previous/          the snapshot before it
//! history/NNNNNN-*/  older snapshots kept for audit, pruned oldest-first
//! .staging-*/        in-progress snapshot, promoted by rename
//! ```
//!
//! Promotion and demotion are renames only, so a slot always holds either a
//! complete snapshot or nothing.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::filesys::dir::{CopyMode, CopyReport, Dir};
use crate::host;
use crate::utils::{file_timestamp, generate_uuid};

const LATEST: &str = "latest";
const PREVIOUS: &str = "previous";
const HISTORY: &str = "history";
const TREE: &str = "tree";
const META: &str = "meta.json";
const STAGING_PREFIX: &str = ".staging-";

/// Metadata stored alongside each snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub source: PathBuf,
    pub revision: Option<String>,
    pub files: u64,
    pub bytes: u64,
}

/// Position of a snapshot in the retained history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Latest,
    Previous,
    History(u32),
}

/// Handle to a retained snapshot
#[derive(Debug, Clone)]
pub struct SnapshotRef {
    pub slot: Slot,
    pub dir: Dir,
    pub meta: SnapshotMeta,
}

impl SnapshotRef {
    /// Copied directory tree
    pub fn tree(&self) -> Dir {
        self.dir.subdir(TREE)
    }
}

/// Outcome of a restore
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Files restored
    pub files: u64,

    /// Entries that could not be restored
    pub failures: Vec<(PathBuf, String)>,

    /// Whether the restored tree was swapped in atomically
    pub swapped: bool,
}

impl RestoreReport {
    /// True if any entry failed to restore
    pub fn degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

impl From<CopyReport> for RestoreReport {
    fn from(report: CopyReport) -> Self {
        Self {
            files: report.files,
            failures: report.failures,
            swapped: false,
        }
    }
}

/// Backup manager
#[derive(Debug, Clone)]
pub struct BackupManager {
    backups_dir: Dir,
    history_limit: usize,
    headroom_bytes: u64,
}

impl BackupManager {
    /// Create a backup manager rooted at `backups_dir`
    pub fn new(backups_dir: Dir, history_limit: usize, headroom_bytes: u64) -> Self {
        Self {
            backups_dir,
            history_limit,
            headroom_bytes,
        }
    }

    fn history_dir(&self) -> Dir {
        self.backups_dir.subdir(HISTORY)
    }

    /// Copy `source` into a new snapshot and promote it to `latest`.
    ///
    /// The live directory is only read. Failures are reported as
    /// [`DeployError::BackupFailed`] and leave the existing `latest` snapshot
    /// in place, although `previous` may already have moved into history.
    pub async fn snapshot(
        &self,
        source: &Dir,
        revision: Option<String>,
    ) -> Result<SnapshotRef, DeployError> {
        let backup_failed = |what: &str, e: DeployError| DeployError::BackupFailed(format!("{what}: {e}"));

        if !source.exists().await {
            return Err(DeployError::BackupFailed(format!(
                "source directory {} does not exist",
                source.path().display()
            )));
        }

        self.backups_dir
            .create()
            .await
            .map_err(|e| backup_failed("cannot create backup directory", e))?;
        self.remove_stale_staging().await;

        let needed = source
            .tree_size()
            .await
            .map_err(|e| backup_failed("cannot measure source tree", e))?
            + self.headroom_bytes;
        if let Some(available) = host::available_space(self.backups_dir.path()) {
            if available < needed {
                return Err(DeployError::BackupFailed(format!(
                    "insufficient disk space: need {} bytes, {} available",
                    needed, available
                )));
            }
        }

        let id = generate_uuid();
        let staging = self.backups_dir.subdir(&format!("{STAGING_PREFIX}{id}"));
        info!(
            "Snapshotting {} into {}",
            source.path().display(),
            self.backups_dir.path().display()
        );

        let copied = match source.copy_tree(&staging.subdir(TREE), CopyMode::Strict).await {
            Ok(report) => report,
            Err(e) => {
                discard(&staging).await;
                return Err(backup_failed("copy failed", e));
            }
        };

        let meta = SnapshotMeta {
            id,
            created_at: Utc::now(),
            source: source.path().to_path_buf(),
            revision,
            files: copied.files,
            bytes: copied.bytes,
        };
        if let Err(e) = staging.file(META).write_json(&meta).await {
            discard(&staging).await;
            return Err(backup_failed("cannot write snapshot metadata", e));
        }

        if let Err(e) = self.promote(&staging).await {
            discard(&staging).await;
            return Err(backup_failed("cannot promote snapshot", e));
        }

        if let Err(e) = self.rotate(self.history_limit).await {
            warn!("Snapshot history pruning failed: {}", e);
        }

        info!(
            "Snapshot {} created ({} files, {} bytes)",
            meta.id, meta.files, meta.bytes
        );
        Ok(SnapshotRef {
            slot: Slot::Latest,
            dir: self.backups_dir.subdir(LATEST),
            meta,
        })
    }

    /// previous → history, latest → previous, staging → latest
    async fn promote(&self, staging: &Dir) -> Result<(), DeployError> {
        let latest = self.backups_dir.subdir(LATEST);
        let previous = self.backups_dir.subdir(PREVIOUS);

        if previous.exists().await {
            let history = self.history_dir();
            history.create().await?;
            let seq = self.next_history_seq().await?;
            let stamp = read_meta(&previous)
                .await
                .map(|m| m.created_at)
                .unwrap_or_else(|_| Utc::now());
            let name = format!("{:06}-{}", seq, file_timestamp(stamp));
            debug!("Demoting previous snapshot to history/{}", name);
            previous.rename(&history.path().join(name)).await?;
        }

        let demoted = latest.exists().await;
        if demoted {
            latest.rename(previous.path()).await?;
        }

        if let Err(e) = staging.rename(latest.path()).await {
            if demoted {
                if let Err(back) = previous.rename(latest.path()).await {
                    warn!("Could not move previous snapshot back to latest: {}", back);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn next_history_seq(&self) -> Result<u32, DeployError> {
        Ok(self
            .history_entries()
            .await?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(1))
    }

    /// Numbered history entries sorted oldest first
    async fn history_entries(&self) -> Result<Vec<(u32, PathBuf)>, DeployError> {
        let history = self.history_dir();
        if !history.exists().await {
            return Ok(Vec::new());
        }

        let mut entries: Vec<(u32, PathBuf)> = history
            .list_dirs()
            .await?
            .into_iter()
            .filter_map(|path| history_seq(&path).map(|seq| (seq, path)))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        Ok(entries)
    }

    /// Prune numbered history snapshots beyond `max_retained`, oldest first.
    /// Returns the removed paths.
    pub async fn rotate(&self, max_retained: usize) -> Result<Vec<PathBuf>, DeployError> {
        let entries = self.history_entries().await?;
        let excess = entries.len().saturating_sub(max_retained);

        let mut removed = Vec::with_capacity(excess);
        for (_, path) in entries.into_iter().take(excess) {
            debug!("Pruning snapshot {}", path.display());
            Dir::new(&path).delete().await?;
            removed.push(path);
        }
        Ok(removed)
    }

    /// The `latest` snapshot, if one exists
    pub async fn latest(&self) -> Result<Option<SnapshotRef>, DeployError> {
        self.load(Slot::Latest, self.backups_dir.subdir(LATEST)).await
    }

    /// The `previous` snapshot, if one exists
    pub async fn previous(&self) -> Result<Option<SnapshotRef>, DeployError> {
        self.load(Slot::Previous, self.backups_dir.subdir(PREVIOUS)).await
    }

    /// Numbered history snapshots, oldest first
    pub async fn history(&self) -> Result<Vec<SnapshotRef>, DeployError> {
        let mut snapshots = Vec::new();
        for (seq, path) in self.history_entries().await? {
            if let Some(snapshot) = self.load(Slot::History(seq), Dir::new(path)).await? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    async fn load(&self, slot: Slot, dir: Dir) -> Result<Option<SnapshotRef>, DeployError> {
        if !dir.exists().await {
            return Ok(None);
        }
        let meta = read_meta(&dir).await?;
        Ok(Some(SnapshotRef { slot, dir, meta }))
    }

    /// Restore a snapshot over `target`.
    ///
    /// Best effort: individual copy failures are logged and collected, never
    /// raised. The snapshot is first copied into a sibling of `target` and
    /// swapped in with two renames; if the swap is not possible the snapshot
    /// is copied over `target` in place. Errors only when the snapshot itself
    /// is unusable.
    pub async fn restore(
        &self,
        snapshot: &SnapshotRef,
        target: &Dir,
    ) -> Result<RestoreReport, DeployError> {
        let tree = snapshot.tree();
        if !tree.exists().await {
            return Err(DeployError::BackupFailed(format!(
                "snapshot {} has no tree at {}",
                snapshot.meta.id,
                tree.path().display()
            )));
        }

        info!(
            "Restoring snapshot {} over {}",
            snapshot.meta.id,
            target.path().display()
        );

        match self.restore_by_swap(&tree, target).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!("Atomic restore unavailable ({}), copying in place", e);
                let report = tree.copy_tree(target, CopyMode::BestEffort).await?;
                Ok(report.into())
            }
        }
    }

    async fn restore_by_swap(&self, tree: &Dir, target: &Dir) -> Result<RestoreReport, DeployError> {
        let (parent, name) = split_target(target.path())?;
        let id = generate_uuid();
        let staged = Dir::new(parent.join(format!(".{name}.restore-{id}")));
        let replaced = parent.join(format!(".{name}.replaced-{id}"));

        let copied = match tree.copy_tree(&staged, CopyMode::BestEffort).await {
            Ok(report) if report.failures.is_empty() => report,
            Ok(report) => {
                // Swapping now would drop the live copies of the failed entries
                discard(&staged).await;
                return Err(DeployError::BackupFailed(format!(
                    "{} entries could not be staged",
                    report.failures.len()
                )));
            }
            Err(e) => {
                discard(&staged).await;
                return Err(e);
            }
        };

        let had_target = target.exists().await;
        if had_target {
            if let Err(e) = target.rename(&replaced).await {
                discard(&staged).await;
                return Err(e);
            }
        }

        if let Err(e) = staged.rename(target.path()).await {
            if had_target {
                if let Err(back) = Dir::new(&replaced).rename(target.path()).await {
                    warn!(
                        "Could not move {} back into place: {}",
                        replaced.display(),
                        back
                    );
                }
            }
            discard(&staged).await;
            return Err(e);
        }

        if had_target {
            discard(&Dir::new(&replaced)).await;
        }

        let mut report = RestoreReport::from(copied);
        report.swapped = true;
        Ok(report)
    }

    /// Remove staging directories left behind by an interrupted run
    async fn remove_stale_staging(&self) {
        let Ok(dirs) = self.backups_dir.list_dirs().await else {
            return;
        };
        for path in dirs {
            let stale = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(STAGING_PREFIX));
            if stale {
                debug!("Removing stale staging directory {}", path.display());
                discard(&Dir::new(path)).await;
            }
        }
    }
}

async fn read_meta(dir: &Dir) -> Result<SnapshotMeta, DeployError> {
    dir.file(META).read_json().await
}

async fn discard(dir: &Dir) {
    if let Err(e) = dir.delete().await {
        warn!("Failed to remove {}: {}", dir.path().display(), e);
    }
}

fn history_seq(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .split('-')
        .next()?
        .parse()
        .ok()
}

fn split_target(target: &Path) -> Result<(PathBuf, String), DeployError> {
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| DeployError::Internal(format!("{} has no parent", target.display())))?;
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DeployError::Internal(format!("{} has no name", target.display())))?;
    Ok((parent.to_path_buf(), name.to_string()))
}
