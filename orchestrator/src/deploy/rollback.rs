//! Rollback coordinator

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use crate::deploy::backup::{BackupManager, RestoreReport, SnapshotRef};
use crate::deploy::service::ServiceController;
use crate::errors::Warning;
use crate::filesys::dir::Dir;
use crate::models::service::ServiceDescriptor;

/// What a rollback managed to do
#[derive(Debug, Default)]
pub struct RollbackReport {
    /// Snapshot that was restored, if any was available
    pub snapshot_id: Option<String>,

    pub restore: Option<RestoreReport>,

    /// Services that came back active after the restart
    pub restarted: Vec<String>,

    /// Best-effort failures, never raised
    pub warnings: Vec<Warning>,
}

impl RollbackReport {
    pub fn restored(&self) -> bool {
        self.restore.is_some()
    }

    /// Restore completed without any failed entry and every restart succeeded
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.restore.as_ref().is_some_and(|r| !r.degraded())
    }
}

#[derive(Debug)]
pub enum RollbackOutcome {
    Completed(RollbackReport),

    /// A rollback was already triggered by this coordinator
    Skipped,
}

/// Rollback coordinator.
///
/// Restores files and restarts services only. It never re-runs migrations or
/// dependency installation.
pub struct RollbackCoordinator {
    backups: BackupManager,
    services: ServiceController,
    target: Dir,
    app: ServiceDescriptor,
    proxy: Option<ServiceDescriptor>,
    triggered: AtomicBool,
}

impl RollbackCoordinator {
    /// `proxy` is restarted after the app only when given.
    pub fn new(
        backups: BackupManager,
        services: ServiceController,
        target: Dir,
        app: ServiceDescriptor,
        proxy: Option<ServiceDescriptor>,
    ) -> Self {
        Self {
            backups,
            services,
            target,
            app,
            proxy,
            triggered: AtomicBool::new(false),
        }
    }

    pub fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Restore `snapshot` (or the `latest` slot) over the live directory and
    /// restart services. Runs at most once per coordinator.
    pub async fn rollback(&self, reason: &str, snapshot: Option<&SnapshotRef>) -> RollbackOutcome {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Rollback already in progress, ignoring nested failure: {}", reason);
            return RollbackOutcome::Skipped;
        }

        error!("Rolling back: {}", reason);
        let mut report = RollbackReport::default();

        let latest = match snapshot {
            Some(snapshot) => Some(snapshot.clone()),
            None => match self.backups.latest().await {
                Ok(latest) => latest,
                Err(e) => {
                    report
                        .warnings
                        .push(Warning::Restore(format!("cannot read latest snapshot: {e}")));
                    None
                }
            },
        };

        match latest {
            Some(snapshot) => {
                report.snapshot_id = Some(snapshot.meta.id.clone());
                match self.backups.restore(&snapshot, &self.target).await {
                    Ok(restore) => {
                        if restore.degraded() {
                            warn!(
                                "Restore degraded: {} entries could not be restored",
                                restore.failures.len()
                            );
                            report.warnings.push(Warning::Restore(format!(
                                "{} entries could not be restored",
                                restore.failures.len()
                            )));
                        }
                        report.restore = Some(restore);
                    }
                    Err(e) => {
                        error!("Restore failed: {}", e);
                        report.warnings.push(Warning::Restore(e.to_string()));
                    }
                }
            }
            None => {
                warn!("No snapshot to restore");
                report
                    .warnings
                    .push(Warning::Restore("no snapshot available".to_string()));
            }
        }

        for service in std::iter::once(&self.app).chain(self.proxy.as_ref()) {
            match self.services.restart_and_wait(service).await {
                Ok(()) => report.restarted.push(service.name.clone()),
                Err(e) => {
                    error!("Restart during rollback failed: {}", e);
                    report.warnings.push(Warning::Rollback(e.to_string()));
                }
            }
        }

        info!(
            "Rollback finished (restored: {}, restarted: {:?})",
            report.restored(),
            report.restarted
        );
        RollbackOutcome::Completed(report)
    }
}
