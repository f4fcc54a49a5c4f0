//! Run FSM tests

use redeploy::deploy::fsm::{RunEvent, RunFsm, RunState};

#[test]
fn test_fsm_initial_state() {
    let fsm = RunFsm::new();
    assert_eq!(fsm.state(), RunState::Start);
    assert!(fsm.error().is_none());
    assert!(fsm.failed_in().is_none());
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = RunFsm::new();

    let expected = [
        RunState::BackingUp,
        RunState::Updating,
        RunState::Restarting,
        RunState::Verifying,
        RunState::RegisteringTasks,
        RunState::Succeeded,
    ];
    for state in expected {
        assert_eq!(fsm.process(RunEvent::StepCompleted).unwrap(), state);
    }
    assert!(fsm.state().is_terminal());
}

#[test]
fn test_fsm_failure_flow() {
    let mut fsm = RunFsm::new();

    fsm.process(RunEvent::StepCompleted).unwrap();
    fsm.process(RunEvent::StepCompleted).unwrap();
    assert_eq!(fsm.state(), RunState::Updating);

    fsm.process(RunEvent::Error("migrate failed".to_string())).unwrap();
    assert_eq!(fsm.state(), RunState::RollingBack);
    assert_eq!(fsm.failed_in(), Some(RunState::Updating));
    assert_eq!(fsm.error(), Some("migrate failed"));

    fsm.process(RunEvent::RollbackFinished).unwrap();
    assert_eq!(fsm.state(), RunState::Failed);
}

#[test]
fn test_fsm_error_from_start() {
    let mut fsm = RunFsm::new();
    fsm.process(RunEvent::Error("no checkout".to_string())).unwrap();
    assert_eq!(fsm.failed_in(), Some(RunState::Start));
    assert!(!RunState::Start.may_have_mutated());
}

#[test]
fn test_fsm_nested_error_during_rollback_is_rejected() {
    let mut fsm = RunFsm::new();
    fsm.process(RunEvent::StepCompleted).unwrap();
    fsm.process(RunEvent::Error("first".to_string())).unwrap();

    assert!(fsm.process(RunEvent::Error("second".to_string())).is_err());
    assert_eq!(fsm.error(), Some("first"));
}

#[test]
fn test_fsm_invalid_transitions() {
    let mut fsm = RunFsm::new();

    // Cannot finish a rollback that never started
    assert!(fsm.process(RunEvent::RollbackFinished).is_err());

    for _ in 0..6 {
        fsm.process(RunEvent::StepCompleted).unwrap();
    }
    assert_eq!(fsm.state(), RunState::Succeeded);

    // Terminal states accept nothing
    assert!(fsm.process(RunEvent::StepCompleted).is_err());
    assert!(fsm.process(RunEvent::Error("late".to_string())).is_err());
}

#[test]
fn test_mutating_states() {
    assert!(!RunState::BackingUp.may_have_mutated());
    assert!(RunState::Updating.may_have_mutated());
    assert!(RunState::Restarting.may_have_mutated());
    assert!(RunState::RegisteringTasks.may_have_mutated());
}
