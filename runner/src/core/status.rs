//! Job status transition rules.
//!
//! A job moves from `running` to exactly one terminal status and never moves
//! again. Re-applying the terminal status it already holds is a no-op.

use thiserror::Error;

use crate::core::types::JobStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal job status transition {from} -> {to}")]
pub struct StatusError {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl JobStatus {
    /// True when `self -> next` is a legal forward transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        self == JobStatus::Running && next.is_terminal()
    }
}

/// Validate a transition and return the resulting status.
pub fn transition(from: JobStatus, to: JobStatus) -> Result<JobStatus, StatusError> {
    if from.can_transition_to(to) || (from == to && from.is_terminal()) {
        return Ok(to);
    }
    Err(StatusError { from, to })
}
