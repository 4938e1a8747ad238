use crate::{JobId, JobStatus};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job store unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job {id} cannot go from {from} to {to}")]
    IllegalTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("resource {0:?} already has an active job")]
    ActiveJobExists(String),

    #[error("job {0} not found")]
    NotFound(JobId),
}

impl StoreError {
    /// Errors that a retry with backoff can be expected to clear.
    pub fn is_transient(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Protocol(_) => true,
            // SQLITE_BUSY, SQLITE_LOCKED and their extended codes.
            sqlx::Error::Database(db) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| matches!(code & 0xff, 5 | 6))
                .unwrap_or(false),
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to launch {program:?}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tool exited with {status}{}", stderr_suffix(.stderr))]
    Exit { status: String, stderr: String },

    #[error("tool did not finish within {0:?}")]
    Timeout(Duration),

    #[error("tool exited successfully but left no artifact at {0}")]
    MissingArtifact(String),

    #[error("tool exited successfully but the artifact at {0} is empty")]
    EmptyArtifact(String),

    #[error("i/o error while supervising tool: {0}")]
    Io(#[from] std::io::Error),
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("priority {0} is outside 1..=9")]
    InvalidPriority(i16),

    #[error("resource id must not be empty")]
    EmptyResource,

    #[error("expected size must be positive, got {0}")]
    InvalidExpectedSize(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}
