//! Application state management

use std::sync::Arc;

use crate::app::options::AppOptions;
use crate::deploy::backup::BackupManager;
use crate::deploy::command::{CommandRunner, SystemRunner};
use crate::deploy::cron::{CrontabTable, PeriodicTaskRegistrar, SystemCrontab};
use crate::deploy::health::HealthVerifier;
use crate::deploy::rollback::RollbackCoordinator;
use crate::deploy::service::ServiceController;
use crate::deploy::update::UpdateExecutor;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::storage::run_log::RunLog;

/// The components a run drives, wired from options
pub struct AppState {
    /// Runner shared by every component that shells out
    pub runner: Arc<dyn CommandRunner>,

    pub backups: BackupManager,

    pub update: UpdateExecutor,

    pub services: ServiceController,

    pub health: HealthVerifier,

    pub registrar: PeriodicTaskRegistrar,

    pub run_log: RunLog,

    pub state_file: File,

    /// Live deployment directory
    pub target: Dir,

    options: AppOptions,
}

impl AppState {
    /// Wire components against the host
    pub fn system(options: AppOptions) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(options.command_timeout));
        let crontab = Arc::new(SystemCrontab::new(runner.clone()));
        Self::new(options, runner, crontab)
    }

    /// Wire components with an explicit runner and crontab
    pub fn new(
        options: AppOptions,
        runner: Arc<dyn CommandRunner>,
        crontab: Arc<dyn CrontabTable>,
    ) -> Self {
        let backups = BackupManager::new(
            Dir::new(&options.backup.dir),
            options.backup.history_limit,
            options.backup.headroom_bytes,
        );

        Self {
            update: UpdateExecutor::new(runner.clone(), options.update.clone()),
            services: ServiceController::new(runner.clone(), options.services.poll_interval),
            health: HealthVerifier::new(options.health.path.clone(), options.health.timeout),
            registrar: PeriodicTaskRegistrar::new(crontab),
            run_log: RunLog::new(options.layout.run_log_file()),
            state_file: options.layout.state_file(),
            target: Dir::new(&options.update.root),
            runner,
            backups,
            options,
        }
    }

    pub fn options(&self) -> &AppOptions {
        &self.options
    }

    /// A rollback coordinator for a single run
    pub fn rollback_coordinator(&self) -> RollbackCoordinator {
        let proxy = self
            .options
            .rollback_restart_proxy
            .then(|| self.options.services.proxy.clone());

        RollbackCoordinator::new(
            self.backups.clone(),
            self.services.clone(),
            self.target.clone(),
            self.options.services.app.clone(),
            proxy,
        )
    }
}
