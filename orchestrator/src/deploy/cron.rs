//! Periodic task registrar backed by the user's crontab

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::deploy::command::{CommandRunner, CommandSpec};
use crate::errors::DeployError;

/// A recurring-task table that can be read and replaced as a whole
#[async_trait]
pub trait CrontabTable: Send + Sync {
    /// Current table contents, empty if none is installed
    async fn read(&self) -> Result<String, DeployError>;

    /// Replace the table
    async fn write(&self, contents: &str) -> Result<(), DeployError>;
}

/// The invoking user's crontab, via `crontab -l` / `crontab -`
pub struct SystemCrontab {
    runner: Arc<dyn CommandRunner>,
}

impl SystemCrontab {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl CrontabTable for SystemCrontab {
    async fn read(&self) -> Result<String, DeployError> {
        let output = self
            .runner
            .run(&CommandSpec::new("crontab").arg("-l"))
            .await
            .map_err(|e| DeployError::TaskRegistrationFailed(e.to_string()))?;

        if output.success() {
            return Ok(output.stdout);
        }
        if output.stderr.to_lowercase().contains("no crontab") {
            debug!("No crontab installed yet");
            return Ok(String::new());
        }
        Err(DeployError::TaskRegistrationFailed(format!(
            "crontab -l: {}",
            output.summary()
        )))
    }

    async fn write(&self, contents: &str) -> Result<(), DeployError> {
        let spec = CommandSpec::new("crontab").arg("-").stdin(contents);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| DeployError::TaskRegistrationFailed(e.to_string()))?;

        if !output.success() {
            return Err(DeployError::TaskRegistrationFailed(format!(
                "crontab -: {}",
                output.summary()
            )));
        }
        Ok(())
    }
}

/// Periodic task registrar
pub struct PeriodicTaskRegistrar {
    table: Arc<dyn CrontabTable>,
}

impl PeriodicTaskRegistrar {
    pub fn new(table: Arc<dyn CrontabTable>) -> Self {
        Self { table }
    }

    /// Install `command` on `schedule`, replacing every entry that carries
    /// `marker`. Returns whether the table changed.
    pub async fn upsert(
        &self,
        marker: &str,
        schedule: &str,
        command: &str,
    ) -> Result<bool, DeployError> {
        validate(marker, schedule)?;

        let existing = self.table.read().await?;
        let updated = upsert_entries(&existing, marker, schedule, command);
        if updated == existing {
            info!("Periodic task '{}' already up to date", marker);
            return Ok(false);
        }

        self.table.write(&updated).await?;
        info!("Registered periodic task '{}' ({})", marker, schedule);
        Ok(true)
    }
}

/// Table contents with every line containing `marker` removed and a single
/// new entry appended.
pub fn upsert_entries(existing: &str, marker: &str, schedule: &str, command: &str) -> String {
    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| !line.contains(marker))
        .map(str::to_string)
        .collect();

    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    let entry = if command.contains(marker) {
        format!("{schedule} {command}")
    } else {
        format!("{schedule} {command} # {marker}")
    };
    lines.push(entry);

    let mut contents = lines.join("\n");
    contents.push('\n');
    contents
}

/// Number of entries carrying `marker`
pub fn count_entries(contents: &str, marker: &str) -> usize {
    contents.lines().filter(|line| line.contains(marker)).count()
}

fn validate(marker: &str, schedule: &str) -> Result<(), DeployError> {
    if marker.trim().is_empty() {
        return Err(DeployError::TaskRegistrationFailed(
            "periodic task marker is empty".to_string(),
        ));
    }
    if marker.contains('\n') {
        return Err(DeployError::TaskRegistrationFailed(
            "periodic task marker spans lines".to_string(),
        ));
    }

    let fields = schedule.split_whitespace().count();
    if !(schedule.starts_with('@') && fields == 1) && fields != 5 {
        return Err(DeployError::TaskRegistrationFailed(format!(
            "invalid schedule '{schedule}'"
        )));
    }
    Ok(())
}
