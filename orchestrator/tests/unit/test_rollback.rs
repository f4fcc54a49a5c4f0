//! Rollback coordinator tests

use std::time::Duration;

use redeploy::deploy::backup::BackupManager;
use redeploy::deploy::rollback::{RollbackCoordinator, RollbackOutcome};
use redeploy::deploy::service::ServiceController;
use redeploy::errors::Warning;
use redeploy::filesys::dir::Dir;
use redeploy::models::service::{ServiceDescriptor, ServiceRole};

use crate::common::{read_tree, Fixture};

fn descriptor(name: &str, role: ServiceRole) -> ServiceDescriptor {
    ServiceDescriptor::managed(name, role, &[], "systemctl", Duration::from_millis(200))
}

fn coordinator(fixture: &Fixture, proxy: bool) -> (RollbackCoordinator, BackupManager) {
    let backups = BackupManager::new(Dir::new(fixture.state_dir().join("backups")), 5, 0);
    let services = ServiceController::new(fixture.host.clone(), Duration::from_millis(10));
    let coordinator = RollbackCoordinator::new(
        backups.clone(),
        services,
        Dir::new(fixture.root()),
        descriptor("gunicorn", ServiceRole::App),
        proxy.then(|| descriptor("nginx", ServiceRole::Proxy)),
    );
    (coordinator, backups)
}

#[tokio::test]
async fn test_rollback_restores_latest_and_runs_once() {
    let fixture = Fixture::new();
    let (coordinator, backups) = coordinator(&fixture, false);
    let before = read_tree(&fixture.root());
    backups
        .snapshot(&Dir::new(fixture.root()), None)
        .await
        .unwrap();

    std::fs::write(fixture.root().join("app.py"), b"broken\n").unwrap();
    std::fs::remove_file(fixture.root().join("static/css/site.css")).unwrap();

    let RollbackOutcome::Completed(report) = coordinator.rollback("migrate failed", None).await
    else {
        panic!("first rollback must run");
    };
    assert!(report.restored());
    assert!(report.is_clean());
    assert_eq!(report.restarted, ["gunicorn"]);
    assert_eq!(read_tree(&fixture.root()), before);
    assert!(coordinator.triggered());

    // A nested failure does not trigger a second rollback
    assert!(matches!(
        coordinator.rollback("nested", None).await,
        RollbackOutcome::Skipped
    ));
    assert!(!fixture.host.called("restart nginx"));
}

#[tokio::test]
async fn test_rollback_without_snapshot_still_restarts() {
    let fixture = Fixture::new();
    let (coordinator, _) = coordinator(&fixture, true);

    let RollbackOutcome::Completed(report) = coordinator.rollback("no backup", None).await else {
        panic!("rollback must run");
    };
    assert!(!report.restored());
    assert!(report
        .warnings
        .iter()
        .any(|w| matches!(w, Warning::Restore(_))));
    assert_eq!(report.restarted, ["gunicorn", "nginx"]);
}

#[tokio::test]
async fn test_rollback_restart_failure_is_not_raised() {
    let fixture = Fixture::new();
    fixture.host.fail_on("restart gunicorn");
    let (coordinator, backups) = coordinator(&fixture, false);
    let snapshot = backups
        .snapshot(&Dir::new(fixture.root()), None)
        .await
        .unwrap();

    let RollbackOutcome::Completed(report) =
        coordinator.rollback("service failed", Some(&snapshot)).await
    else {
        panic!("rollback must run");
    };
    assert!(report.restored());
    assert!(report.restarted.is_empty());
    assert!(!report.is_clean());
    assert!(report
        .warnings
        .iter()
        .any(|w| matches!(w, Warning::Rollback(_))));
}
