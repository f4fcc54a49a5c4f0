//! Append-only run history

use tracing::warn;

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::models::deployment::DeploymentRun;

/// Run log backed by a JSON-lines file.
///
/// Records are only ever appended; nothing rewrites or truncates the file.
#[derive(Debug, Clone)]
pub struct RunLog {
    file: File,
}

impl RunLog {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// Append a finished run
    pub async fn append(&self, run: &DeploymentRun) -> Result<(), DeployError> {
        if !run.is_finished() {
            return Err(DeployError::Internal(format!(
                "refusing to persist unfinished run {}",
                run.id
            )));
        }
        let line = serde_json::to_string(run)?;
        self.file.append_line(&line).await
    }

    /// The most recent `limit` runs, oldest first. Unparseable lines are
    /// skipped with a warning.
    pub async fn load_recent(&self, limit: usize) -> Result<Vec<DeploymentRun>, DeployError> {
        if !self.file.exists().await {
            return Ok(Vec::new());
        }

        let contents = self.file.read_string().await?;
        let mut runs: Vec<DeploymentRun> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .filter_map(|(idx, line)| match serde_json::from_str(line) {
                Ok(run) => Some(run),
                Err(e) => {
                    warn!("Skipping malformed run log line {}: {}", idx + 1, e);
                    None
                }
            })
            .collect();

        let skip = runs.len().saturating_sub(limit);
        Ok(runs.split_off(skip))
    }
}
