//! Job state machine.
//!
//! ```text
//! Pending -> Running -> Succeeded
//!              |  ^  -> Failed
//!              v  |
//!          RetryWaiting
//! (any non-terminal) -> Canceled
//! ```
//!
//! Restart recovery additionally moves interrupted `Running` and
//! `RetryWaiting` jobs back to `Pending`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting for a worker slot.
    Pending,
    /// Occupying a worker slot with a live attempt.
    Running,
    /// Backing off before the next attempt. Holds no worker slot.
    RetryWaiting,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Running,
        JobState::RetryWaiting,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Canceled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::{Canceled, Failed, Pending, RetryWaiting, Running, Succeeded};

        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Canceled) => true,
            (Pending, Running) => true,
            // A recovered job that already used its final attempt.
            (Pending, Failed) => true,
            (Running, Succeeded | Failed | RetryWaiting) => true,
            (RetryWaiting, Running) => true,
            // Restart recovery.
            (Running | RetryWaiting, Pending) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::RetryWaiting => "retry_waiting",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
