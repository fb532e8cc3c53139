//! Status transition rules for tasks, sessions, and phases.
//!
//! Every status write in the repository is checked here inside the write
//! transaction. An illegal transition is a programmer error and surfaces as
//! [`Error::Precondition`] without mutating state.

use crate::error::{Error, Result};
use crate::models::{PhaseStatus, SessionStatus, TaskStatus};

/// Legal task transitions. `failed -> pending` is the automatic-retry and
/// reset path; `completed/skipped -> pending` only happens on reset.
pub fn task_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Skipped)
            | (Running, Completed)
            | (Running, Failed)
            | (Failed, Running)
            | (Failed, Paused)
            | (Failed, Pending)
            | (Paused, Running)
            | (Paused, Pending)
            | (Completed, Pending)
            | (Skipped, Pending)
    )
}

/// Sessions only ever leave `running`, and only once.
pub fn session_transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
        (from, to),
        (Running, Completed) | (Running, Failed) | (Running, Killed)
    )
}

pub fn phase_transition_allowed(from: PhaseStatus, to: PhaseStatus) -> bool {
    use PhaseStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Failed, Pending)
            | (Completed, Pending)
    )
}

pub fn check_task_transition(from: TaskStatus, to: TaskStatus) -> Result<()> {
    if task_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(Error::Precondition(format!(
            "invalid task transition: {} -> {}",
            from.as_str(),
            to.as_str()
        )))
    }
}

pub fn check_session_transition(from: SessionStatus, to: SessionStatus) -> Result<()> {
    if session_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(Error::Precondition(format!(
            "invalid session transition: {} -> {}",
            from.as_str(),
            to.as_str()
        )))
    }
}

pub fn check_phase_transition(from: PhaseStatus, to: PhaseStatus) -> Result<()> {
    if phase_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(Error::Precondition(format!(
            "invalid phase transition: {} -> {}",
            from.as_str(),
            to.as_str()
        )))
    }
}

/// Derive a phase's status from its tasks: completed iff all finished,
/// failed iff any task failed and nothing can still run, running while any
/// task runs, pending otherwise.
pub fn derive_phase_status(task_statuses: &[TaskStatus]) -> PhaseStatus {
    use TaskStatus::*;
    if task_statuses.iter().all(|s| s.is_finished()) {
        return PhaseStatus::Completed;
    }
    let any_failed = task_statuses.iter().any(|s| *s == Failed);
    let any_open = task_statuses
        .iter()
        .any(|s| matches!(s, Pending | Running));
    if any_failed && !any_open {
        return PhaseStatus::Failed;
    }
    if task_statuses.iter().any(|s| *s == Running) {
        return PhaseStatus::Running;
    }
    PhaseStatus::Pending
}
