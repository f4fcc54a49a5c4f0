//! Error types for the deployment orchestrator

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Update step an `UpdateFailed` error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStep {
    Fetch,
    Install,
    Migrate,
    Build,
}

impl fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateStep::Fetch => "fetch",
            UpdateStep::Install => "install",
            UpdateStep::Migrate => "migrate",
            UpdateStep::Build => "build",
        };
        f.write_str(name)
    }
}

/// Fatal error raised by a pipeline step.
///
/// Every variant aborts the run. Non-fatal anomalies are [`Warning`]s.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Must run as '{expected}', running as '{actual}'")]
    WrongIdentity { expected: String, actual: String },

    #[error("Directory does not exist: {}", .0.display())]
    DirectoryMissing(PathBuf),

    #[error("Not a valid source checkout: {0}")]
    RepositoryInvalid(String),

    #[error("Dependency manifest missing: {}", .0.display())]
    ManifestMissing(PathBuf),

    #[error("Another deployment run holds the lock at {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("Backup failed: {0}")]
    BackupFailed(String),

    #[error("Configuration check failed: {0}")]
    ConfigInvalid(String),

    #[error("Update failed during {step}: {reason}")]
    UpdateFailed { step: UpdateStep, reason: String },

    #[error("Application service '{service}' failed: {reason}")]
    AppServiceFailed { service: String, reason: String },

    #[error("Proxy service '{service}' failed: {reason}")]
    ProxyServiceFailed { service: String, reason: String },

    #[error("Periodic task registration failed: {0}")]
    TaskRegistrationFailed(String),

    #[error("Command error: {0}")]
    CommandFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error taxonomy used for reporting and exit classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PreconditionFailed,
    AlreadyRunning,
    BackupFailed,
    UpdateFailed,
    ServiceStartFailed,
    TaskRegistrationFailed,
    Internal,
}

impl DeployError {
    /// Classify the error into the reporting taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::WrongIdentity { .. }
            | DeployError::DirectoryMissing(_)
            | DeployError::RepositoryInvalid(_)
            | DeployError::ManifestMissing(_) => ErrorKind::PreconditionFailed,
            DeployError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            DeployError::BackupFailed(_) => ErrorKind::BackupFailed,
            DeployError::ConfigInvalid(_) | DeployError::UpdateFailed { .. } => {
                ErrorKind::UpdateFailed
            }
            DeployError::AppServiceFailed { .. } | DeployError::ProxyServiceFailed { .. } => {
                ErrorKind::ServiceStartFailed
            }
            DeployError::TaskRegistrationFailed(_) => ErrorKind::TaskRegistrationFailed,
            DeployError::IoError(_)
            | DeployError::JsonError(_)
            | DeployError::CommandFailed(_)
            | DeployError::ConfigError(_)
            | DeployError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Short machine-readable code, e.g. `app_service_failed`
    pub fn code(&self) -> &'static str {
        match self {
            DeployError::IoError(_) => "io",
            DeployError::JsonError(_) => "json",
            DeployError::WrongIdentity { .. } => "wrong_identity",
            DeployError::DirectoryMissing(_) => "directory_missing",
            DeployError::RepositoryInvalid(_) => "repository_invalid",
            DeployError::ManifestMissing(_) => "manifest_missing",
            DeployError::AlreadyRunning(_) => "already_running",
            DeployError::BackupFailed(_) => "backup_failed",
            DeployError::ConfigInvalid(_) => "config_invalid",
            DeployError::UpdateFailed { .. } => "update_failed",
            DeployError::AppServiceFailed { .. } => "app_service_failed",
            DeployError::ProxyServiceFailed { .. } => "proxy_service_failed",
            DeployError::TaskRegistrationFailed(_) => "task_registration_failed",
            DeployError::CommandFailed(_) => "command_failed",
            DeployError::ConfigError(_) => "config_error",
            DeployError::Internal(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}

/// Non-fatal anomaly recorded on a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum Warning {
    /// Health endpoint unreachable or returned an error status
    HealthCheck(String),

    /// Security lint reported problems
    Config(String),

    /// Individual files could not be restored
    Restore(String),

    /// A best-effort rollback sub-step failed
    Rollback(String),
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::HealthCheck(msg) => write!(f, "health check: {msg}"),
            Warning::Config(msg) => write!(f, "config: {msg}"),
            Warning::Restore(msg) => write!(f, "restore: {msg}"),
            Warning::Rollback(msg) => write!(f, "rollback: {msg}"),
        }
    }
}
