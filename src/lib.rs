use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::fmt;
use uuid::Uuid;

pub mod admission;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod partial;
pub mod server;
pub mod status;
pub mod telemetry;
pub mod watcher;
pub mod worker;

pub use status::{JobStatus, Transition, TransitionOutcome};

pub type JobId = i64;

/// Scheduling priority. Lower values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(i16);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const LOWEST: Priority = Priority(9);

    pub fn new(value: i16) -> Option<Self> {
        (Self::HIGHEST.0..=Self::LOWEST.0)
            .contains(&value)
            .then_some(Priority(value))
    }

    pub fn get(self) -> i16 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(5)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies the Worker a dispatcher bound to an in-progress job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(Uuid);

impl ProcessHandle {
    pub fn new() -> Self {
        ProcessHandle(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(ProcessHandle)
    }
}

impl Default for ProcessHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub resource_id: String,
    pub priority: Priority,
    /// Total size of the finished artifact, when the caller knows it.
    pub expected_size: Option<i64>,
}

impl EnqueueRequest {
    pub fn new(resource_id: impl Into<String>) -> Self {
        EnqueueRequest {
            resource_id: resource_id.into(),
            priority: Priority::default(),
            expected_size: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn expected_size(mut self, size: i64) -> Self {
        self.expected_size = Some(size);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub resource_id: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub progress_percent: i16,
    pub progress_size: i64,
    pub expected_size: Option<i64>,
    /// Raw handle text. A value that does not parse as a [`ProcessHandle`]
    /// can never belong to a live Worker.
    pub process_handle: Option<String>,
    pub pid: Option<u32>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn handle(&self) -> Option<ProcessHandle> {
        self.process_handle.as_deref().and_then(ProcessHandle::parse)
    }
}

fn decode_err(column: &str, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: source.into(),
    }
}

fn millis(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    match row.try_get::<Option<i64>, _>(column)? {
        None => Ok(None),
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or_else(|| decode_err(column, format!("timestamp out of range: {ms}"))),
    }
}

fn required_millis(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    millis(row, column)?.ok_or_else(|| decode_err(column, "unexpected NULL timestamp"))
}

impl<'r> FromRow<'r, SqliteRow> for Job {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = status.parse::<JobStatus>().map_err(|e| decode_err("status", e))?;

        let priority: i16 = row.try_get("priority")?;
        let priority = Priority::new(priority)
            .ok_or_else(|| decode_err("priority", format!("priority out of range: {priority}")))?;

        let pid = row
            .try_get::<Option<i64>, _>("pid")?
            .map(u32::try_from)
            .transpose()
            .map_err(|e| decode_err("pid", e))?;

        Ok(Job {
            id: row.try_get("id")?,
            resource_id: row.try_get("resource_id")?,
            status,
            priority,
            progress_percent: row.try_get("progress_percent")?,
            progress_size: row.try_get("progress_size")?,
            expected_size: row.try_get("expected_size")?,
            process_handle: row.try_get("process_handle")?,
            pid,
            error_message: row.try_get("error_message")?,
            created_at: required_millis(row, "created_at")?,
            updated_at: required_millis(row, "updated_at")?,
            started_at: millis(row, "started_at")?,
            completed_at: millis(row, "completed_at")?,
        })
    }
}
