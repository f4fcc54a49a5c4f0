//! Deployment models

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DeployError, ErrorKind, Warning};

/// The live deployment directory at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    /// Deployment root
    pub root: PathBuf,

    /// Checked-out revision, if known
    pub revision: Option<String>,

    /// Package names declared in the dependency manifest
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Whether the last run against this state succeeded
    pub last_known_good: bool,

    /// When this record was written
    pub updated_at: DateTime<Utc>,
}

impl DeploymentState {
    /// Package names from a requirements-style manifest.
    ///
    /// Comments, blank lines and option lines (`-r`, `--hash`) are ignored;
    /// version specifiers, extras and markers are stripped.
    pub fn parse_manifest(contents: &str) -> Vec<String> {
        contents
            .lines()
            .map(|line| line.split('#').next().unwrap_or("").trim())
            .filter(|line| !line.is_empty() && !line.starts_with('-'))
            .filter_map(|line| {
                let end = line
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
                    .unwrap_or(line.len());
                let name = &line[..end];
                (!name.is_empty()).then(|| name.to_string())
            })
            .collect()
    }
}

/// Final outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every step completed
    Succeeded,

    /// A fatal error occurred before anything was mutated, or the restore
    /// could not run
    Failed,

    /// A fatal error occurred and the latest snapshot was restored
    RolledBack,
}

impl RunOutcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed | RunOutcome::RolledBack => 1,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Succeeded => f.write_str("succeeded"),
            RunOutcome::Failed => f.write_str("failed"),
            RunOutcome::RolledBack => f.write_str("rolled back"),
        }
    }
}

/// Pipeline step names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Preflight,
    Backup,
    Fetch,
    InstallDependencies,
    ConfigCheck,
    SecurityCheck,
    Migrate,
    BuildAssets,
    RestartApp,
    RestartProxy,
    HealthCheck,
    RegisterTask,
    Restore,
    RestartAfterRollback,
}

/// Step completion status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Warning,
    Failed,
    Skipped,
}

/// A single timed step result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: StepName,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Fatal error summary persisted with a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl From<&DeployError> for RunError {
    fn from(err: &DeployError) -> Self {
        Self {
            kind: err.kind(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// One invocation of the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRun {
    /// Unique run ID
    pub id: String,

    /// Host the run executed on
    pub hostname: String,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Revision requested on the command line, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_revision: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_before: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_after: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,

    /// Step results in execution order
    #[serde(default)]
    pub steps: Vec<StepResult>,

    #[serde(default)]
    pub warnings: Vec<Warning>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,

    /// Snapshot captured by this run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,

    /// Text log this run wrote to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_ref: Option<PathBuf>,
}

impl DeploymentRun {
    /// Start a new run record
    pub fn start(id: String, hostname: String, requested_revision: Option<String>) -> Self {
        Self {
            id,
            hostname,
            started_at: Utc::now(),
            finished_at: None,
            requested_revision,
            revision_before: None,
            revision_after: None,
            outcome: None,
            steps: Vec::new(),
            warnings: Vec::new(),
            error: None,
            snapshot: None,
            log_ref: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Append a step result
    pub fn record_step(
        &mut self,
        step: StepName,
        status: StepStatus,
        started_at: DateTime<Utc>,
        detail: Option<String>,
    ) {
        if self.is_finished() {
            return;
        }
        self.steps.push(StepResult {
            step,
            status,
            started_at,
            finished_at: Utc::now(),
            detail,
        });
    }

    /// Record a non-fatal anomaly
    pub fn warn(&mut self, warning: Warning) {
        if !self.is_finished() {
            self.warnings.push(warning);
        }
    }

    /// Whether a step was attempted (reached any status other than skipped)
    pub fn attempted(&self, step: StepName) -> bool {
        self.steps
            .iter()
            .any(|s| s.step == step && s.status != StepStatus::Skipped)
    }

    /// Close the record. Later mutations are ignored.
    pub fn finish(&mut self, outcome: RunOutcome, error: Option<&DeployError>) {
        if self.is_finished() {
            return;
        }
        self.outcome = Some(outcome);
        self.error = error.map(RunError::from);
        self.finished_at = Some(Utc::now());
    }
}
