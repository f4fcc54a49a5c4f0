//! Service controller: restart and readiness polling

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::deploy::command::{CommandRunner, CommandSpec};
use crate::errors::DeployError;
use crate::models::service::ServiceDescriptor;

/// Bound on the diagnostic status capture after a failed wait
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Service controller
#[derive(Clone)]
pub struct ServiceController {
    runner: Arc<dyn CommandRunner>,
    poll_interval: Duration,
}

impl ServiceController {
    pub fn new(runner: Arc<dyn CommandRunner>, poll_interval: Duration) -> Self {
        Self {
            runner,
            poll_interval,
        }
    }

    /// Issue the privileged restart command
    pub async fn restart(&self, service: &ServiceDescriptor) -> Result<(), DeployError> {
        info!("Restarting {} service '{}'", service.role, service.name);
        let spec = command(&service.restart, service)?;
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| service.start_failure(format!("restart could not run: {e}")))?;

        if !output.success() {
            return Err(service.start_failure(format!("restart failed: {}", output.summary())));
        }
        Ok(())
    }

    /// Poll `is-active` at a fixed interval until it succeeds or `timeout`
    /// elapses.
    pub async fn await_active(
        &self,
        service: &ServiceDescriptor,
        timeout: Duration,
    ) -> Result<(), DeployError> {
        let spec = command(&service.is_active, service)?;
        let deadline = Instant::now() + timeout;
        let mut polls = 0u32;

        loop {
            polls += 1;
            // A hung is-active counts as not active and never outlives the deadline
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.runner.run(&spec)).await {
                Ok(Ok(output)) if output.success() => {
                    info!("Service '{}' is active", service.name);
                    return Ok(());
                }
                Ok(Ok(output)) => debug!("Service '{}' not active yet ({})", service.name, output.summary()),
                Ok(Err(e)) => debug!("is-active for '{}' could not run: {}", service.name, e),
                Err(_) => debug!("is-active for '{}' did not answer in time", service.name),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }

        match tokio::time::timeout(STATUS_TIMEOUT, self.status(service)).await {
            Ok(Ok(status)) => error!("Service '{}' status:\n{}", service.name, status.trim_end()),
            Ok(Err(e)) => warn!("Could not capture status of '{}': {}", service.name, e),
            Err(_) => warn!("Status of '{}' did not answer in time", service.name),
        }
        Err(service.start_failure(format!(
            "not active after {:?} ({} polls)",
            timeout, polls
        )))
    }

    /// Restart and wait for the descriptor's start timeout
    pub async fn restart_and_wait(&self, service: &ServiceDescriptor) -> Result<(), DeployError> {
        self.restart(service).await?;
        self.await_active(service, service.start_timeout).await
    }

    /// Human-readable status output
    pub async fn status(&self, service: &ServiceDescriptor) -> Result<String, DeployError> {
        let spec = command(&service.status, service)?;
        let output = self.runner.run(&spec).await?;
        Ok(if output.stdout.trim().is_empty() {
            output.stderr
        } else {
            output.stdout
        })
    }
}

fn command(argv: &[String], service: &ServiceDescriptor) -> Result<CommandSpec, DeployError> {
    CommandSpec::from_argv(argv).ok_or_else(|| {
        DeployError::ConfigError(format!("service '{}' has an empty command", service.name))
    })
}
