//! End-to-end pipeline tests against a scripted host

use std::path::PathBuf;

use tokio_test::{assert_err, assert_ok};

use redeploy::app::run::run;
use redeploy::deploy::backup::BackupManager;
use redeploy::deploy::cron::count_entries;
use redeploy::deploy::lock::RunLock;
use redeploy::errors::{DeployError, ErrorKind, Warning};
use redeploy::filesys::dir::Dir;
use redeploy::models::deployment::{DeploymentState, RunOutcome, StepName, StepStatus};
use redeploy::storage::layout::StorageLayout;
use redeploy::storage::run_log::RunLog;
use redeploy::storage::state_file::load_state;

use crate::common::{read_tree, Fixture, MARKER};

fn step_status(run: &redeploy::models::deployment::DeploymentRun, step: StepName) -> Option<StepStatus> {
    run.steps.iter().find(|s| s.step == step).map(|s| s.status)
}

#[tokio::test]
async fn test_fresh_deployment_of_abc123() {
    let fixture = Fixture::with_remote_head("abc123");
    let state = fixture.app_state();

    let run = assert_ok!(run(&state, None).await);

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    assert_eq!(RunOutcome::Succeeded.exit_code(), 0);
    assert!(run.error.is_none());
    assert_eq!(run.revision_before.as_deref(), Some("0000aaa"));
    assert_eq!(run.revision_after.as_deref(), Some("abc123"));

    // Backup created before the update
    let snapshot_id = run.snapshot.clone().unwrap();
    let latest = state.backups.latest().await.unwrap().unwrap();
    assert_eq!(latest.meta.id, snapshot_id);
    assert_eq!(latest.meta.revision.as_deref(), Some("0000aaa"));
    assert_eq!(
        std::fs::read(latest.tree().path().join("app.py")).unwrap(),
        b"release 0000aaa\n"
    );

    // X installed, migrations applied, both services active
    let manifest = fixture.root().join("requirements.txt");
    assert!(fixture
        .host
        .called(&format!("pip install -r {}", manifest.display())));
    assert!(fixture.host.called("manage.py migrate --noinput"));
    assert!(fixture.host.called("manage.py collectstatic --noinput"));
    assert!(fixture.host.called("systemctl restart gunicorn"));
    assert!(fixture.host.called("systemctl is-active --quiet gunicorn"));
    assert!(fixture.host.called("systemctl restart nginx"));
    assert!(fixture.host.called("systemctl is-active --quiet nginx"));

    let saved: DeploymentState = load_state(&state.state_file).await.unwrap().unwrap();
    assert_eq!(saved.revision.as_deref(), Some("abc123"));
    assert_eq!(saved.dependencies, ["X"]);
    assert!(saved.last_known_good);

    // Steps recorded in order
    let steps: Vec<StepName> = run.steps.iter().map(|s| s.step).collect();
    assert_eq!(
        steps,
        [
            StepName::Preflight,
            StepName::Backup,
            StepName::Fetch,
            StepName::InstallDependencies,
            StepName::ConfigCheck,
            StepName::SecurityCheck,
            StepName::Migrate,
            StepName::BuildAssets,
            StepName::RestartApp,
            StepName::RestartProxy,
            StepName::HealthCheck,
            StepName::RegisterTask,
        ]
    );
}

#[tokio::test]
async fn test_repeated_runs_keep_one_task_entry() {
    let fixture = Fixture::new();
    let state = fixture.app_state();

    let first = assert_ok!(run(&state, None).await);
    let table_after_first = fixture.crontab.contents();
    let second = assert_ok!(run(&state, None).await);

    assert_eq!(first.outcome, Some(RunOutcome::Succeeded));
    assert_eq!(second.outcome, Some(RunOutcome::Succeeded));
    assert_eq!(count_entries(&fixture.crontab.contents(), MARKER), 1);
    assert_eq!(fixture.crontab.contents(), table_after_first);
    assert!(fixture.crontab.contents().contains("--max-files=1"));

    let history = RunLog::new(StorageLayout::new(fixture.state_dir()).run_log_file());
    let runs = history.load_recent(10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].id, first.id);
    assert_eq!(runs[1].id, second.id);
}

#[tokio::test]
async fn test_backup_slots_stay_bounded() {
    let fixture = Fixture::new();
    let state = fixture.app_state();

    for _ in 0..9 {
        let run = run(&state, None).await.unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    }

    let backups_dir = fixture.state_dir().join("backups");
    let top: Vec<PathBuf> = Dir::new(&backups_dir).list_dirs().await.unwrap();
    let names: Vec<String> = top
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, ["history", "latest", "previous"]);

    let manager = BackupManager::new(Dir::new(&backups_dir), 5, 0);
    assert!(manager.latest().await.unwrap().is_some());
    assert!(manager.previous().await.unwrap().is_some());
    assert_eq!(manager.history().await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_update_failure_restores_pre_run_files() {
    let fixture = Fixture::new();
    fixture.host.fail_on("pip install -r");
    let state = fixture.app_state();
    let before = read_tree(&fixture.root());

    let run = assert_ok!(run(&state, None).await);

    assert_eq!(run.outcome, Some(RunOutcome::RolledBack));
    assert_ne!(run.outcome.unwrap().exit_code(), 0);
    let error = run.error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::UpdateFailed);

    let after = read_tree(&fixture.root());
    for (path, contents) in &before {
        assert_eq!(after.get(path), Some(contents), "{} differs", path.display());
    }
    assert!(!fixture.root().join("added.py").exists());
    assert_eq!(step_status(&run, StepName::Restore), Some(StepStatus::Ok));
    assert!(!run.attempted(StepName::Migrate));

    let saved = load_state(&state.state_file).await.unwrap().unwrap();
    assert_eq!(saved.revision.as_deref(), Some("0000aaa"));
    assert!(saved.last_known_good);
}

#[tokio::test]
async fn test_missing_manifest_aborts_before_any_restart() {
    let fixture = Fixture::new();
    std::fs::remove_file(fixture.root().join("requirements.txt")).unwrap();
    let state = fixture.app_state();

    let run = assert_ok!(run(&state, None).await);

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    let error = run.error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::PreconditionFailed);
    assert_eq!(error.code, "manifest_missing");
    assert!(run.snapshot.is_none());
    assert!(!fixture.host.called("restart"));
    assert!(!fixture.host.called("git reset"));
    assert_eq!(step_status(&run, StepName::Restore), Some(StepStatus::Skipped));
}

#[tokio::test]
async fn test_unreachable_health_endpoint_is_only_a_warning() {
    let fixture = Fixture::new();
    let state = fixture.app_state();

    let run = assert_ok!(run(&state, None).await);

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    assert_eq!(step_status(&run, StepName::HealthCheck), Some(StepStatus::Warning));
    assert!(run
        .warnings
        .iter()
        .any(|w| matches!(w, Warning::HealthCheck(_))));
    assert_eq!(step_status(&run, StepName::RegisterTask), Some(StepStatus::Ok));
}

#[tokio::test]
async fn test_fatal_health_check_rolls_back() {
    let mut fixture = Fixture::new();
    fixture.settings.health.fatal = true;
    let state = fixture.app_state();

    let run = assert_ok!(run(&state, None).await);

    assert_eq!(run.outcome, Some(RunOutcome::RolledBack));
    assert_eq!(run.error.as_ref().unwrap().code, "app_service_failed");
    assert!(!run.attempted(StepName::RegisterTask));
    assert!(fixture.crontab.contents().is_empty());
}

#[tokio::test]
async fn test_migration_failure_skips_assets_and_restarts_app() {
    let fixture = Fixture::new();
    fixture.host.fail_on("migrate");
    let state = fixture.app_state();
    let before = read_tree(&fixture.root());

    let run = assert_ok!(run(&state, None).await);

    assert_eq!(run.outcome, Some(RunOutcome::RolledBack));
    assert_ne!(run.outcome.unwrap().exit_code(), 0);
    assert!(!fixture.host.called("collectstatic"));
    assert!(!run.attempted(StepName::BuildAssets));
    assert_eq!(read_tree(&fixture.root()), before);

    // Only the rollback restarted the app; the proxy was left alone
    assert!(fixture.host.called("systemctl restart gunicorn"));
    assert!(!fixture.host.called("systemctl restart nginx"));
    assert_eq!(
        step_status(&run, StepName::RestartAfterRollback),
        Some(StepStatus::Ok)
    );

    // Migrations were not re-run during rollback
    let migrations = fixture
        .host
        .calls()
        .iter()
        .filter(|c| c.contains("migrate"))
        .count();
    assert_eq!(migrations, 1);
}

#[tokio::test]
async fn test_app_start_timeout_short_circuits_proxy() {
    let fixture = Fixture::new();
    fixture.host.never_active("gunicorn");
    let state = fixture.app_state();

    let run = assert_ok!(run(&state, None).await);

    assert_eq!(run.outcome, Some(RunOutcome::RolledBack));
    let error = run.error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::ServiceStartFailed);
    assert_eq!(error.code, "app_service_failed");
    assert!(!fixture.host.called("restart nginx"));
    assert!(!run.attempted(StepName::RestartProxy));
    assert!(fixture.host.called("systemctl status --no-pager gunicorn"));

    // The post-rollback restart also timed out; recorded, not raised
    assert_eq!(
        step_status(&run, StepName::RestartAfterRollback),
        Some(StepStatus::Failed)
    );
    assert!(run.warnings.iter().any(|w| matches!(w, Warning::Rollback(_))));
}

#[tokio::test]
async fn test_proxy_failure_is_attributed_to_proxy() {
    let fixture = Fixture::new();
    fixture.host.fail_on("restart nginx");
    let state = fixture.app_state();

    let run = assert_ok!(run(&state, None).await);

    assert_eq!(run.outcome, Some(RunOutcome::RolledBack));
    assert_eq!(run.error.unwrap().code, "proxy_service_failed");
}

#[tokio::test]
async fn test_requested_revision_is_checked_out() {
    let fixture = Fixture::new();
    let state = fixture.app_state();

    let run = assert_ok!(run(&state, Some("feed42".to_string())).await);

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    assert_eq!(run.revision_after.as_deref(), Some("feed42"));
    assert!(fixture.host.called("git reset --hard feed42"));
}

#[tokio::test]
async fn test_concurrent_run_is_rejected() {
    let fixture = Fixture::new();
    let state = fixture.app_state();
    let lock_path = StorageLayout::new(fixture.state_dir()).lock_file();
    let _held = RunLock::acquire(lock_path.path()).unwrap();

    let result = run(&state, None).await;

    let err = assert_err!(result);
    assert!(matches!(err, DeployError::AlreadyRunning(_)));
    assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
    assert!(!fixture.host.called("git"));
    assert!(!StorageLayout::new(fixture.state_dir())
        .run_log_file()
        .exists()
        .await);
}

#[tokio::test]
async fn test_wrong_identity_is_rejected() {
    let mut fixture = Fixture::new();
    fixture.settings.service_account = Some("tpdb".to_string());
    let state = fixture.app_state();

    let err = assert_err!(run(&state, None).await);
    assert!(matches!(err, DeployError::WrongIdentity { .. }));
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert_eq!(fixture.host.calls(), ["id -un"]);
}

#[tokio::test]
async fn test_missing_root_fails_without_backup() {
    let fixture = Fixture::new();
    std::fs::remove_dir_all(fixture.root()).unwrap();
    let state = fixture.app_state();

    let run = assert_ok!(run(&state, None).await);

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    assert_eq!(run.error.unwrap().code, "directory_missing");
    assert!(state.backups.latest().await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_config_check_rolls_back_before_migrating() {
    let fixture = Fixture::new();
    fixture.host.fail_on("manage.py check");
    let state = fixture.app_state();
    let before = read_tree(&fixture.root());

    let run = assert_ok!(run(&state, None).await);

    assert_eq!(run.outcome, Some(RunOutcome::RolledBack));
    assert_eq!(run.error.clone().unwrap().code, "config_invalid");
    assert_eq!(step_status(&run, StepName::ConfigCheck), Some(StepStatus::Failed));
    assert!(!run.attempted(StepName::Migrate));
    assert!(!fixture.host.called("migrate"));
    assert_eq!(step_status(&run, StepName::Restore), Some(StepStatus::Ok));
    assert_eq!(read_tree(&fixture.root()), before);
}

#[tokio::test]
async fn test_failed_security_lint_is_only_a_warning() {
    let fixture = Fixture::new();
    fixture.host.fail_on("manage.py check --deploy");
    let state = fixture.app_state();

    let run = assert_ok!(run(&state, None).await);

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    assert_eq!(step_status(&run, StepName::ConfigCheck), Some(StepStatus::Ok));
    assert_eq!(step_status(&run, StepName::SecurityCheck), Some(StepStatus::Warning));
    assert!(run.warnings.iter().any(|w| matches!(w, Warning::Config(_))));
    assert!(fixture.host.called("manage.py migrate"));
}

#[tokio::test]
async fn test_local_modifications_are_stashed_before_reset() {
    let fixture = Fixture::new();
    fixture.host.make_dirty();
    let state = fixture.app_state();

    let run = assert_ok!(run(&state, None).await);

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    let calls = fixture.host.calls();
    let stash = calls.iter().position(|c| c.starts_with("git stash push"));
    let reset = calls.iter().position(|c| c.starts_with("git reset --hard"));
    assert!(stash.is_some(), "no stash in {:?}", calls);
    assert!(stash < reset);
}

#[tokio::test]
async fn test_clean_checkout_is_not_stashed() {
    let fixture = Fixture::new();
    let state = fixture.app_state();

    assert_ok!(run(&state, None).await);
    assert!(!fixture.host.called("git stash"));
}

#[tokio::test]
async fn test_backup_failure_stops_before_fetch() {
    let mut fixture = Fixture::new();
    let blocker = fixture.tmp.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    fixture.settings.backup.dir = Some(blocker.join("backups").to_string_lossy().into_owned());
    let state = fixture.app_state();
    let before = read_tree(&fixture.root());

    let run = assert_ok!(run(&state, None).await);

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    let error = run.error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::BackupFailed);
    assert!(!fixture.host.called("git fetch"));
    assert!(!fixture.host.called("git reset"));
    assert!(!fixture.host.called("restart"));
    assert_eq!(step_status(&run, StepName::Backup), Some(StepStatus::Failed));
    assert_eq!(step_status(&run, StepName::Restore), Some(StepStatus::Skipped));
    assert_eq!(read_tree(&fixture.root()), before);
    assert!(load_state(&state.state_file).await.unwrap().is_none());
}
