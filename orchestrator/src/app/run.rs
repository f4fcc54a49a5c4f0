//! Deployment run: a linear pipeline with one failure handler

use std::future::Future;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::app::state::AppState;
use crate::deploy::backup::SnapshotRef;
use crate::deploy::command::{CommandRunner, CommandSpec};
use crate::deploy::fsm::{RunEvent, RunFsm};
use crate::deploy::health::HealthStatus;
use crate::deploy::lock::RunLock;
use crate::deploy::rollback::RollbackOutcome;
use crate::errors::{DeployError, Warning};
use crate::host;
use crate::models::deployment::{DeploymentRun, DeploymentState, RunOutcome, StepName, StepStatus};
use crate::storage::state_file::{load_state, save_state};
use crate::utils::generate_uuid;

/// Execute one deployment run.
///
/// Returns the finished run record, which is also appended to the run log.
/// `Err` means the run was refused before it started (wrong identity, lock
/// held elsewhere, unusable state directory) and nothing was recorded.
pub async fn run(state: &AppState, revision: Option<String>) -> Result<DeploymentRun, DeployError> {
    let options = state.options();
    check_identity(state.runner.as_ref(), options.service_account.as_deref()).await?;

    options.layout.setup().await?;
    let lock = RunLock::acquire(options.layout.lock_file().path())?;

    let mut record = DeploymentRun::start(generate_uuid(), host::hostname(), revision);
    record.log_ref = options.log_file.clone();
    info!("Starting deployment run {} on {}", record.id, record.hostname);

    let mut pipeline = Pipeline::new(state, record);
    let result = pipeline.execute().await;
    let outcome = match &result {
        Ok(()) => RunOutcome::Succeeded,
        Err(e) => pipeline.handle_failure(e).await,
    };

    let Pipeline {
        mut run,
        dependencies,
        mutated,
        ..
    } = pipeline;
    run.finish(outcome, result.as_ref().err());
    info!(
        "Deployment run {} {} ({} steps, {} warnings)",
        run.id,
        outcome,
        run.steps.len(),
        run.warnings.len()
    );

    persist(state, &run, dependencies, mutated).await;
    drop(lock);
    Ok(run)
}

/// Fail with `WrongIdentity` unless running as `expected`
pub async fn check_identity(
    runner: &dyn CommandRunner,
    expected: Option<&str>,
) -> Result<(), DeployError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let output = runner.run(&CommandSpec::new("id").arg("-un")).await?;
    if !output.success() {
        return Err(DeployError::CommandFailed(format!("id -un: {}", output.summary())));
    }

    let actual = output.stdout.trim();
    if actual != expected {
        return Err(DeployError::WrongIdentity {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

struct Pipeline<'a> {
    state: &'a AppState,
    run: DeploymentRun,
    fsm: RunFsm,
    snapshot: Option<SnapshotRef>,
    dependencies: Option<Vec<String>>,
    mutated: bool,
}

impl<'a> Pipeline<'a> {
    fn new(state: &'a AppState, run: DeploymentRun) -> Self {
        Self {
            state,
            run,
            fsm: RunFsm::new(),
            snapshot: None,
            dependencies: None,
            mutated: false,
        }
    }

    async fn execute(&mut self) -> Result<(), DeployError> {
        let state = self.state;
        let options = state.options();
        let run_id = self.run.id.clone();

        // Start
        self.run.revision_before = self.step(StepName::Preflight, preflight(state)).await?;
        self.advance()?;

        // BackingUp
        let revision = self.run.revision_before.clone();
        let snapshot = self
            .step(StepName::Backup, state.backups.snapshot(&state.target, revision))
            .await?;
        self.run.snapshot = Some(snapshot.meta.id.clone());
        self.snapshot = Some(snapshot);
        self.advance()?;

        // Updating
        let requested = self.run.requested_revision.clone();
        let head = self
            .step(StepName::Fetch, state.update.fetch(requested.as_deref(), &run_id))
            .await?;
        self.run.revision_after = Some(head);

        let dependencies = self
            .step(StepName::InstallDependencies, state.update.install_dependencies())
            .await?;
        self.dependencies = Some(dependencies);

        self.step(StepName::ConfigCheck, state.update.check_config())
            .await?;

        let started = self.begin(StepName::SecurityCheck);
        match state.update.security_lint().await {
            Some(warning) => {
                self.run.record_step(
                    StepName::SecurityCheck,
                    StepStatus::Warning,
                    started,
                    Some(warning.to_string()),
                );
                self.run.warn(warning);
            }
            None => self
                .run
                .record_step(StepName::SecurityCheck, StepStatus::Ok, started, None),
        }

        self.step(StepName::Migrate, state.update.apply_migrations())
            .await?;
        self.step(StepName::BuildAssets, state.update.build_assets())
            .await?;
        self.advance()?;

        // Restarting
        self.step(
            StepName::RestartApp,
            state.services.restart_and_wait(&options.services.app),
        )
        .await?;
        self.step(
            StepName::RestartProxy,
            state.services.restart_and_wait(&options.services.proxy),
        )
        .await?;
        self.advance()?;

        // Verifying
        let started = self.begin(StepName::HealthCheck);
        match state.health.check(&options.health.endpoint).await {
            HealthStatus::Healthy => {
                self.run
                    .record_step(StepName::HealthCheck, StepStatus::Ok, started, None);
            }
            HealthStatus::Unhealthy(reason) if options.health.fatal => {
                let err = options
                    .services
                    .app
                    .start_failure(format!("health check failed: {reason}"));
                self.run.record_step(
                    StepName::HealthCheck,
                    StepStatus::Failed,
                    started,
                    Some(err.to_string()),
                );
                return Err(err);
            }
            HealthStatus::Unhealthy(reason) => {
                self.run.record_step(
                    StepName::HealthCheck,
                    StepStatus::Warning,
                    started,
                    Some(reason.clone()),
                );
                self.run.warn(Warning::HealthCheck(reason));
            }
        }
        self.advance()?;

        // RegisteringTasks
        match &options.periodic_task {
            Some(task) => {
                self.step(
                    StepName::RegisterTask,
                    state
                        .registrar
                        .upsert(&task.marker, &task.schedule, &task.command),
                )
                .await?;
            }
            None => {
                let started = self.begin(StepName::RegisterTask);
                self.run.record_step(
                    StepName::RegisterTask,
                    StepStatus::Skipped,
                    started,
                    Some("disabled".to_string()),
                );
            }
        }
        self.advance()?;

        Ok(())
    }

    /// The single failure handler: roll back when the live directory may
    /// have changed, then close the state machine.
    async fn handle_failure(&mut self, err: &DeployError) -> RunOutcome {
        let failed_in = self.fsm.state();
        error!(
            "Run {} failed in state {:?}: {}",
            self.run.id, failed_in, err
        );
        if let Err(e) = self.fsm.process(RunEvent::Error(err.to_string())) {
            warn!("{}", e);
        }

        let outcome = if failed_in.may_have_mutated() {
            self.mutated = true;
            self.roll_back(err).await
        } else {
            info!("Nothing was modified, skipping restore");
            self.run.record_step(
                StepName::Restore,
                StepStatus::Skipped,
                Utc::now(),
                Some("nothing was modified".to_string()),
            );
            RunOutcome::Failed
        };

        if let Err(e) = self.fsm.process(RunEvent::RollbackFinished) {
            warn!("{}", e);
        }
        outcome
    }

    async fn roll_back(&mut self, err: &DeployError) -> RunOutcome {
        let coordinator = self.state.rollback_coordinator();
        let started = Utc::now();

        let report = match coordinator
            .rollback(&err.to_string(), self.snapshot.as_ref())
            .await
        {
            RollbackOutcome::Completed(report) => report,
            RollbackOutcome::Skipped => return RunOutcome::Failed,
        };

        let (status, detail) = match &report.restore {
            Some(restore) => (
                if restore.degraded() {
                    StepStatus::Warning
                } else {
                    StepStatus::Ok
                },
                format!(
                    "snapshot {}: {} files, {} failures",
                    report.snapshot_id.as_deref().unwrap_or("-"),
                    restore.files,
                    restore.failures.len()
                ),
            ),
            None => (StepStatus::Failed, "no snapshot restored".to_string()),
        };
        self.run
            .record_step(StepName::Restore, status, started, Some(detail));

        let restart_failed = report
            .warnings
            .iter()
            .any(|w| matches!(w, Warning::Rollback(_)));
        self.run.record_step(
            StepName::RestartAfterRollback,
            if restart_failed {
                StepStatus::Failed
            } else {
                StepStatus::Ok
            },
            started,
            Some(format!("restarted: {}", report.restarted.join(", "))),
        );

        let restored = report.restored();
        for warning in report.warnings {
            self.run.warn(warning);
        }

        if restored {
            RunOutcome::RolledBack
        } else {
            RunOutcome::Failed
        }
    }

    fn begin(&self, step: StepName) -> DateTime<Utc> {
        info!("Step {:?} started", step);
        Utc::now()
    }

    /// Run one step and record its timing and status
    async fn step<T, F>(&mut self, step: StepName, fut: F) -> Result<T, DeployError>
    where
        F: Future<Output = Result<T, DeployError>>,
    {
        let started = self.begin(step);
        let result = fut.await;
        match &result {
            Ok(_) => {
                info!("Step {:?} completed", step);
                self.run.record_step(step, StepStatus::Ok, started, None);
            }
            Err(e) => {
                error!("Step {:?} failed: {}", step, e);
                self.run
                    .record_step(step, StepStatus::Failed, started, Some(e.to_string()));
            }
        }
        result
    }

    fn advance(&mut self) -> Result<(), DeployError> {
        self.fsm
            .process(RunEvent::StepCompleted)
            .map(|_| ())
            .map_err(DeployError::Internal)
    }
}

/// Deployment root, checkout and manifest must exist before anything runs.
/// Returns the current HEAD when it resolves.
async fn preflight(state: &AppState) -> Result<Option<String>, DeployError> {
    if !state.target.exists().await {
        return Err(DeployError::DirectoryMissing(
            state.target.path().to_path_buf(),
        ));
    }

    let repo = state.update.repo();
    repo.verify().await?;

    let manifest = state.update.manifest_path();
    if !tokio::fs::try_exists(&manifest).await.unwrap_or(false) {
        return Err(DeployError::ManifestMissing(manifest));
    }

    Ok(repo.head().await.ok())
}

/// Append the run to the history and update the persisted state.
/// Failures here are logged, never raised.
async fn persist(
    state: &AppState,
    run: &DeploymentRun,
    dependencies: Option<Vec<String>>,
    mutated: bool,
) {
    if let Err(e) = state.run_log.append(run).await {
        error!("Failed to append run {} to the run log: {}", run.id, e);
    }

    let previous = match load_state(&state.state_file).await {
        Ok(previous) => previous,
        Err(e) => {
            warn!("Ignoring unreadable deployment state: {}", e);
            None
        }
    };
    let previous_deps = previous
        .as_ref()
        .map(|s| s.dependencies.clone())
        .unwrap_or_default();

    let next = match run.outcome {
        Some(RunOutcome::Succeeded) => DeploymentState {
            root: state.target.path().to_path_buf(),
            revision: run.revision_after.clone(),
            dependencies: dependencies.unwrap_or_default(),
            last_known_good: true,
            updated_at: Utc::now(),
        },
        Some(RunOutcome::RolledBack) => DeploymentState {
            root: state.target.path().to_path_buf(),
            revision: run.revision_before.clone(),
            dependencies: previous_deps,
            last_known_good: !run
                .warnings
                .iter()
                .any(|w| matches!(w, Warning::Restore(_))),
            updated_at: Utc::now(),
        },
        _ if mutated => DeploymentState {
            root: state.target.path().to_path_buf(),
            revision: None,
            dependencies: Vec::new(),
            last_known_good: false,
            updated_at: Utc::now(),
        },
        _ => return,
    };

    if let Err(e) = save_state(&state.state_file, &next).await {
        error!("Failed to save deployment state: {}", e);
    }
}
