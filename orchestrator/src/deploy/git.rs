//! Git operations on the live checkout

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::deploy::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::errors::{DeployError, UpdateStep};

/// A git working tree driven through a [`CommandRunner`]
#[derive(Clone)]
pub struct GitRepo {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
}

impl GitRepo {
    pub fn new(runner: Arc<dyn CommandRunner>, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            root: root.into(),
        }
    }

    async fn git<I, S>(&self, args: I) -> Result<CommandOutput, DeployError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new("git").args(args).current_dir(&self.root);
        self.runner.run(&spec).await
    }

    /// Fail with `RepositoryInvalid` unless root is a git working tree
    pub async fn verify(&self) -> Result<(), DeployError> {
        let output = self
            .git(["rev-parse", "--is-inside-work-tree"])
            .await
            .map_err(|e| DeployError::RepositoryInvalid(e.to_string()))?;

        if !output.success() || output.stdout.trim() != "true" {
            return Err(DeployError::RepositoryInvalid(format!(
                "{} is not a git working tree ({})",
                self.root.display(),
                output.summary()
            )));
        }
        Ok(())
    }

    /// Current HEAD commit
    pub async fn head(&self) -> Result<String, DeployError> {
        let output = self.git(["rev-parse", "HEAD"]).await?;
        if !output.success() {
            return Err(DeployError::RepositoryInvalid(format!(
                "cannot resolve HEAD: {}",
                output.summary()
            )));
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Whether tracked files have uncommitted modifications
    pub async fn has_local_changes(&self) -> Result<bool, DeployError> {
        let output = self
            .git(["status", "--porcelain", "--untracked-files=no"])
            .await?;
        if !output.success() {
            return Err(fetch_failed(format!("git status: {}", output.summary())));
        }
        Ok(!output.stdout.trim().is_empty())
    }

    /// Stash local modifications so they are preserved, not discarded
    pub async fn stash(&self, message: &str) -> Result<(), DeployError> {
        let output = self.git(["stash", "push", "-m", message]).await?;
        if !output.success() {
            return Err(fetch_failed(format!("git stash: {}", output.summary())));
        }
        Ok(())
    }

    /// Fetch a branch from a remote
    pub async fn fetch(&self, remote: &str, branch: &str) -> Result<(), DeployError> {
        debug!("Fetching {} {}", remote, branch);
        let output = self.git(["fetch", "--prune", remote, branch]).await?;
        if !output.success() {
            return Err(fetch_failed(format!("git fetch: {}", output.summary())));
        }
        Ok(())
    }

    /// Hard reset the working tree to a revision
    pub async fn reset_hard(&self, revision: &str) -> Result<(), DeployError> {
        let output = self.git(["reset", "--hard", revision]).await?;
        if !output.success() {
            return Err(fetch_failed(format!(
                "git reset --hard {}: {}",
                revision,
                output.summary()
            )));
        }
        Ok(())
    }

    /// Bring the checkout to `revision` (or the tip of `remote/branch`).
    ///
    /// Local modifications are stashed first. Returns the new HEAD.
    pub async fn sync_to(
        &self,
        remote: &str,
        branch: &str,
        revision: Option<&str>,
        stash_message: &str,
    ) -> Result<String, DeployError> {
        self.verify().await?;

        if self.has_local_changes().await? {
            info!("Stashing local modifications in {}", self.root.display());
            self.stash(stash_message).await?;
        }

        self.fetch(remote, branch).await?;

        let target = revision
            .map(str::to_string)
            .unwrap_or_else(|| format!("{remote}/{branch}"));
        self.reset_hard(&target).await?;

        let head = self.head().await?;
        info!("Checkout now at {}", head);
        Ok(head)
    }
}

fn fetch_failed(reason: String) -> DeployError {
    DeployError::UpdateFailed {
        step: UpdateStep::Fetch,
        reason,
    }
}
