//! Task lifecycle states
//!
//! ```text
//!   Pending ──dispatch──► Executing ──ok──► Completed
//!                             │
//!                             └──error / cancel──► Failed(reason)
//! ```
//!
//! `Completed` and `Failed` are terminal: a task is executed at most once.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Lifecycle state of a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum TaskState {
    /// Created, waiting in a queue
    #[default]
    Pending,
    /// Dispatched to a worker
    Executing,
    /// Finished normally
    Completed,
    /// Finished with an error or was cancelled
    Failed(String),
}

impl TaskState {
    /// Short state name without the failure reason
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Executing => "executing",
            TaskState::Completed => "completed",
            TaskState::Failed(_) => "failed",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TaskState::Pending)
    }

    pub fn is_executing(&self) -> bool {
        matches!(self, TaskState::Executing)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskState::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskState::Failed(_))
    }

    /// Returns true for `Completed` and `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed(_))
    }

    pub fn can_transition_to(&self, target: &TaskState) -> bool {
        matches!(
            (self, target),
            (TaskState::Pending, TaskState::Executing)
                | (TaskState::Executing, TaskState::Completed)
                | (TaskState::Executing, TaskState::Failed(_))
        )
    }

    /// Moves to `target`, rejecting any transition not in the diagram above
    pub fn transition_to(&mut self, target: TaskState) -> Result<(), DomainError> {
        if !self.can_transition_to(&target) {
            return Err(DomainError::InvalidState {
                from: self.name().to_string(),
                to: target.name().to_string(),
            });
        }
        *self = target;
        Ok(())
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Failed(reason) => write!(f, "failed: {reason}"),
            other => write!(f, "{}", other.name()),
        }
    }
}
