//! Finite State Machine for a deployment run

use serde::{Deserialize, Serialize};

/// Run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Preflight checks
    Start,

    /// Snapshotting the live directory
    BackingUp,

    /// Fetch, install, migrate, build
    Updating,

    /// Restarting services and waiting for them
    Restarting,

    /// Health verification
    Verifying,

    /// Periodic task registration
    RegisteringTasks,

    /// Terminal: every step completed
    Succeeded,

    /// Restoring the latest snapshot after a fatal error
    RollingBack,

    /// Terminal: the run failed
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    /// Whether the live directory may have been mutated by the time the run
    /// is in this state
    pub fn may_have_mutated(&self) -> bool {
        matches!(
            self,
            RunState::Updating
                | RunState::Restarting
                | RunState::Verifying
                | RunState::RegisteringTasks
        )
    }
}

/// Run event
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// The current step completed
    StepCompleted,

    /// A fatal error occurred
    Error(String),

    /// The rollback sequence finished
    RollbackFinished,
}

/// Run FSM.
///
/// `Start → BackingUp → Updating → Restarting → Verifying → RegisteringTasks
/// → Succeeded`, with any non-terminal forward state moving to
/// `RollingBack → Failed` on error.
#[derive(Debug, Clone)]
pub struct RunFsm {
    state: RunState,
    failed_in: Option<RunState>,
    error: Option<String>,
}

impl RunFsm {
    /// Create a new FSM in the start state
    pub fn new() -> Self {
        Self {
            state: RunState::Start,
            failed_in: None,
            error: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> RunState {
        self.state
    }

    /// State the run was in when the fatal error occurred
    pub fn failed_in(&self) -> Option<RunState> {
        self.failed_in
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: RunEvent) -> Result<RunState, String> {
        let new_state = match (self.state, &event) {
            (RunState::Start, RunEvent::StepCompleted) => RunState::BackingUp,
            (RunState::BackingUp, RunEvent::StepCompleted) => RunState::Updating,
            (RunState::Updating, RunEvent::StepCompleted) => RunState::Restarting,
            (RunState::Restarting, RunEvent::StepCompleted) => RunState::Verifying,
            (RunState::Verifying, RunEvent::StepCompleted) => RunState::RegisteringTasks,
            (RunState::RegisteringTasks, RunEvent::StepCompleted) => RunState::Succeeded,

            (RunState::RollingBack, RunEvent::RollbackFinished) => RunState::Failed,

            (state, RunEvent::Error(err))
                if !state.is_terminal() && state != RunState::RollingBack =>
            {
                self.failed_in = Some(state);
                self.error = Some(err.clone());
                RunState::RollingBack
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for RunFsm {
    fn default() -> Self {
        Self::new()
    }
}
