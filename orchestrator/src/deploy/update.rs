//! Update executor: source fetch, dependencies, migrations, assets

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::deploy::command::{expand_placeholders, CommandOutput, CommandRunner, CommandSpec};
use crate::deploy::git::GitRepo;
use crate::errors::{DeployError, UpdateStep, Warning};
use crate::models::deployment::DeploymentState;

/// Lifecycle command argv lists. An empty list disables the step.
#[derive(Debug, Clone, Default)]
pub struct LifecycleCommands {
    pub upgrade_installer: Vec<String>,
    pub install: Vec<String>,
    pub config_check: Vec<String>,
    pub security_check: Vec<String>,
    pub migrate: Vec<String>,
    pub build_assets: Vec<String>,
}

/// Update executor options
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Live deployment directory
    pub root: PathBuf,

    pub remote: String,

    pub branch: String,

    /// Dependency manifest, relative to root
    pub manifest: String,

    /// Profile environment variable and value passed to lifecycle commands
    pub profile: (String, String),

    pub commands: LifecycleCommands,
}

/// Update executor
pub struct UpdateExecutor {
    runner: Arc<dyn CommandRunner>,
    repo: GitRepo,
    options: UpdateOptions,
}

impl UpdateExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, options: UpdateOptions) -> Self {
        let repo = GitRepo::new(runner.clone(), options.root.clone());
        Self {
            runner,
            repo,
            options,
        }
    }

    pub fn repo(&self) -> &GitRepo {
        &self.repo
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.options.root.join(&self.options.manifest)
    }

    /// Reset the checkout to `revision`, or the tip of the tracked branch.
    /// Returns the new HEAD.
    pub async fn fetch(&self, revision: Option<&str>, run_id: &str) -> Result<String, DeployError> {
        info!(
            "Fetching {}/{} into {}",
            self.options.remote,
            self.options.branch,
            self.options.root.display()
        );
        self.repo
            .sync_to(
                &self.options.remote,
                &self.options.branch,
                revision,
                &format!("redeploy autostash before run {run_id}"),
            )
            .await
    }

    /// Upgrade the package manager, then install from the manifest.
    ///
    /// Returns the package names the manifest declares.
    pub async fn install_dependencies(&self) -> Result<Vec<String>, DeployError> {
        let manifest = self.manifest_path();
        let contents = match tokio::fs::read_to_string(&manifest).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeployError::ManifestMissing(manifest));
            }
            Err(e) => {
                return Err(DeployError::UpdateFailed {
                    step: UpdateStep::Install,
                    reason: format!("cannot read {}: {}", manifest.display(), e),
                });
            }
        };

        info!("Upgrading package installer");
        self.run_step(&self.options.commands.upgrade_installer, UpdateStep::Install)
            .await?;

        info!("Installing dependencies from {}", manifest.display());
        self.run_step(&self.options.commands.install, UpdateStep::Install)
            .await?;

        Ok(DeploymentState::parse_manifest(&contents))
    }

    /// Configuration self-check. Failure aborts the run.
    pub async fn check_config(&self) -> Result<(), DeployError> {
        info!("Running configuration check");
        let Some(output) = self.run_lifecycle(&self.options.commands.config_check).await? else {
            return Ok(());
        };
        if !output.success() {
            return Err(DeployError::ConfigInvalid(output.summary()));
        }
        Ok(())
    }

    /// Security lint. Problems are returned as a warning, never raised.
    pub async fn security_lint(&self) -> Option<Warning> {
        info!("Running security lint");
        match self.run_lifecycle(&self.options.commands.security_check).await {
            Ok(Some(output)) if !output.success() => {
                warn!("Security lint reported problems: {}", output.summary());
                Some(Warning::Config(output.summary()))
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Security lint could not run: {}", e);
                Some(Warning::Config(e.to_string()))
            }
        }
    }

    /// Apply schema migrations
    pub async fn apply_migrations(&self) -> Result<(), DeployError> {
        info!("Applying migrations");
        self.run_step(&self.options.commands.migrate, UpdateStep::Migrate)
            .await
    }

    /// Rebuild derived assets
    pub async fn build_assets(&self) -> Result<(), DeployError> {
        info!("Building assets");
        self.run_step(&self.options.commands.build_assets, UpdateStep::Build)
            .await
    }

    async fn run_step(&self, argv: &[String], step: UpdateStep) -> Result<(), DeployError> {
        let output = self
            .run_lifecycle(argv)
            .await
            .map_err(|e| DeployError::UpdateFailed {
                step,
                reason: e.to_string(),
            })?;

        match output {
            Some(output) if !output.success() => Err(DeployError::UpdateFailed {
                step,
                reason: output.summary(),
            }),
            _ => Ok(()),
        }
    }

    /// Run a lifecycle command in the app root with the profile set.
    /// `None` when the command is disabled.
    async fn run_lifecycle(&self, argv: &[String]) -> Result<Option<CommandOutput>, DeployError> {
        let root = self.options.root.to_string_lossy().into_owned();
        let manifest = self.manifest_path().to_string_lossy().into_owned();
        let argv = expand_placeholders(argv, &[("root", &root), ("manifest", &manifest)]);

        let Some(spec) = CommandSpec::from_argv(&argv) else {
            return Ok(None);
        };
        let mut spec = spec.current_dir(&self.options.root);
        let (var, value) = &self.options.profile;
        if !var.is_empty() {
            spec = spec.env(var.as_str(), value.as_str());
        }

        self.runner.run(&spec).await.map(Some)
    }
}
