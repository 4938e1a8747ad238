//! Job lifecycle.
//!
//! ```text
//! pending ──admit──▶ in_progress ──complete──▶ completed
//!    │                 │    │
//!    │                 │    └──────fail──────▶ failed
//!    │                 └──requeue──▶ pending
//!    └───────cancel────┴──────────▶ cancelled
//! ```
//!
//! Any transition requested on a terminal job is ignored rather than
//! rejected, so a finalize that runs twice is harmless.

use crate::{Job, ProcessHandle};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (Pending, Cancelled)
                | (InProgress, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    /// Strict: no case folding or trimming.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A requested status change together with its side effects.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Dispatcher admits a pending job and binds it to a Worker.
    Admit { handle: ProcessHandle },
    /// Worker finished and the artifact checked out.
    Complete { artifact_size: i64 },
    /// Worker failed to launch, exited badly, or timed out.
    Fail { message: String },
    /// Orphan recovery. Progress is kept as last observed.
    Requeue,
    /// External cancellation request.
    Cancel,
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Admit { .. } => JobStatus::InProgress,
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::Fail { .. } => JobStatus::Failed,
            Transition::Requeue => JobStatus::Pending,
            Transition::Cancel => JobStatus::Cancelled,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transition::Admit { .. } => "admit",
            Transition::Complete { .. } => "complete",
            Transition::Fail { .. } => "fail",
            Transition::Requeue => "requeue",
            Transition::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The row was updated; carries the job as written.
    Applied(Job),
    /// The job was already terminal, nothing was written.
    Ignored(JobStatus),
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}
