use crate::error::StoreError;
use crate::status::{JobStatus, Transition, TransitionOutcome};
use crate::{EnqueueRequest, Job, JobId, ProcessHandle};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, QueryBuilder, Sqlite};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

macro_rules! job_columns {
    () => {
        "id, resource_id, status, priority, progress_percent, progress_size, expected_size, \
         process_handle, pid, error_message, created_at, updated_at, started_at, completed_at"
    };
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_connections: u32,
    /// Extra attempts made after a transient failure.
    pub retries: u32,
    /// First backoff delay; doubled on every further attempt.
    pub backoff: Duration,
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            max_connections: 5,
            retries: 5,
            backoff: Duration::from_millis(100),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Filter for [`DbHandle::find`]. Results always come back in admission
/// order: priority, then creation time, then id.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub statuses: Vec<JobStatus>,
    pub resource_id: Option<String>,
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl JobQuery {
    pub fn with_status(status: JobStatus) -> Self {
        JobQuery {
            statuses: vec![status],
            ..Default::default()
        }
    }

    pub fn for_resource(resource_id: impl Into<String>) -> Self {
        JobQuery {
            resource_id: Some(resource_id.into()),
            ..Default::default()
        }
    }

    pub fn active(mut self) -> Self {
        self.statuses = vec![JobStatus::Pending, JobStatus::InProgress];
        self
    }

    pub fn updated_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.updated_before = Some(cutoff);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Clone)]
pub struct DbHandle {
    pool: SqlitePool,
    options: StoreOptions,
}

impl DbHandle {
    /// Opens (creating if needed) the store at `url` and applies the schema.
    ///
    /// Every pooled connection to `sqlite::memory:` is its own database, so
    /// in-memory stores need `max_connections == 1`.
    pub async fn new(url: &str, options: StoreOptions) -> Result<Self, StoreError> {
        let connect = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle { pool, options })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn retrying<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempts = 0;
        let mut backoff = self.options.backoff;
        loop {
            attempts += 1;
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) if StoreError::is_transient(&err) => {
                    if attempts > self.options.retries {
                        return Err(StoreError::Unavailable {
                            attempts,
                            source: err,
                        });
                    }
                    warn!(op, attempts, error = %err, backoff_ms = backoff.as_millis() as u64, "Transient store error, retrying");
                    sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Inserts a new pending job. Fails with
    /// [`StoreError::ActiveJobExists`] when the resource already has one.
    #[instrument(name = "db.create", skip_all, fields(resource_id = %request.resource_id))]
    pub async fn create(&self, request: &EnqueueRequest) -> Result<JobId, StoreError> {
        let now = Utc::now().timestamp_millis();
        let pool = &self.pool;
        let result = self
            .retrying("create", move || async move {
                sqlx::query(
                    "INSERT INTO jobs \
                    (resource_id, status, priority, expected_size, created_at, updated_at) \
                    VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(request.resource_id.as_str())
                .bind(JobStatus::Pending.as_str())
                .bind(request.priority.get())
                .bind(request.expected_size)
                .bind(now)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

        match result {
            Ok(done) => {
                debug!(job_id = done.last_insert_rowid(), "Created job");
                Ok(done.last_insert_rowid())
            }
            Err(StoreError::Database(sqlx::Error::Database(db))) if db.is_unique_violation() => {
                Err(StoreError::ActiveJobExists(request.resource_id.clone()))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let pool = &self.pool;
        self.retrying("get", move || async move {
            sqlx::query_as::<_, Job>(concat!("SELECT ", job_columns!(), " FROM jobs WHERE id = ?"))
                .bind(id)
                .fetch_optional(pool)
                .await
        })
        .await
    }

    pub async fn find(&self, query: &JobQuery) -> Result<Vec<Job>, StoreError> {
        let pool = &self.pool;
        self.retrying("find", move || async move {
            let mut builder =
                QueryBuilder::<Sqlite>::new(concat!("SELECT ", job_columns!(), " FROM jobs WHERE 1 = 1"));
            if !query.statuses.is_empty() {
                builder.push(" AND status IN (");
                let mut statuses = builder.separated(", ");
                for status in &query.statuses {
                    statuses.push_bind(status.as_str());
                }
                statuses.push_unseparated(")");
            }
            if let Some(resource_id) = &query.resource_id {
                builder.push(" AND resource_id = ").push_bind(resource_id.as_str());
            }
            if let Some(cutoff) = query.updated_before {
                builder
                    .push(" AND updated_at < ")
                    .push_bind(cutoff.timestamp_millis());
            }
            builder.push(" ORDER BY priority ASC, created_at ASC, id ASC");
            if let Some(limit) = query.limit {
                builder.push(" LIMIT ").push_bind(i64::from(limit));
            }
            builder.build_query_as::<Job>().fetch_all(pool).await
        })
        .await
    }

    /// The pending or in-progress job for `resource_id`, if any.
    pub async fn active_job(&self, resource_id: &str) -> Result<Option<Job>, StoreError> {
        let jobs = self
            .find(&JobQuery::for_resource(resource_id).active().limit(1))
            .await?;
        Ok(jobs.into_iter().next())
    }

    /// Moves a job through the lifecycle. Transitions on terminal jobs are
    /// ignored; anything else outside the lifecycle is rejected.
    #[instrument(name = "db.apply", skip_all, fields(job_id = id, transition = transition.name()))]
    pub async fn apply(
        &self,
        id: JobId,
        transition: Transition,
    ) -> Result<TransitionOutcome, StoreError> {
        let target = transition.target();
        loop {
            let current = self.get(id).await?.ok_or(StoreError::NotFound(id))?;
            if current.status.is_terminal() {
                debug!(status = %current.status, "Job already terminal, ignoring");
                return Ok(TransitionOutcome::Ignored(current.status));
            }
            if !current.status.can_transition_to(target) {
                return Err(StoreError::IllegalTransition {
                    id,
                    from: current.status,
                    to: target,
                });
            }

            if let Some(job) = self.write_transition(id, current.status, &transition).await? {
                debug!(from = %current.status, to = %job.status, "Applied transition");
                return Ok(TransitionOutcome::Applied(job));
            }
            debug!(from = %current.status, "Job changed concurrently, re-reading");
        }
    }

    async fn write_transition(
        &self,
        id: JobId,
        from: JobStatus,
        transition: &Transition,
    ) -> Result<Option<Job>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let pool = &self.pool;
        self.retrying(transition.name(), move || async move {
            let query = match transition {
                Transition::Admit { handle } => sqlx::query_as::<_, Job>(concat!(
                    "UPDATE jobs SET status = 'in_progress', process_handle = ?, pid = NULL, \
                     error_message = NULL, started_at = ?, updated_at = ? \
                     WHERE id = ? AND status = ? RETURNING ",
                    job_columns!()
                ))
                .bind(handle.to_string())
                .bind(now)
                .bind(now),
                Transition::Complete { artifact_size } => sqlx::query_as::<_, Job>(concat!(
                    "UPDATE jobs SET status = 'completed', progress_percent = 100, \
                     progress_size = MAX(progress_size, ?), process_handle = NULL, \
                     completed_at = ?, updated_at = ? \
                     WHERE id = ? AND status = ? RETURNING ",
                    job_columns!()
                ))
                .bind(*artifact_size)
                .bind(now)
                .bind(now),
                Transition::Fail { message } => sqlx::query_as::<_, Job>(concat!(
                    "UPDATE jobs SET status = 'failed', error_message = ?, process_handle = NULL, \
                     completed_at = ?, updated_at = ? \
                     WHERE id = ? AND status = ? RETURNING ",
                    job_columns!()
                ))
                .bind(message.as_str())
                .bind(now)
                .bind(now),
                Transition::Requeue => sqlx::query_as::<_, Job>(concat!(
                    "UPDATE jobs SET status = 'pending', process_handle = NULL, pid = NULL, \
                     updated_at = ? \
                     WHERE id = ? AND status = ? RETURNING ",
                    job_columns!()
                ))
                .bind(now),
                Transition::Cancel => sqlx::query_as::<_, Job>(concat!(
                    "UPDATE jobs SET status = 'cancelled', \
                     completed_at = CASE WHEN status = 'in_progress' THEN ? ELSE NULL END, \
                     updated_at = ? \
                     WHERE id = ? AND status = ? RETURNING ",
                    job_columns!()
                ))
                .bind(now)
                .bind(now),
            };
            query.bind(id).bind(from.as_str()).fetch_optional(pool).await
        })
        .await
    }

    /// Pushes an observed partial size into an in-progress job. Size and
    /// percent never move backwards, and a row is only touched when one of
    /// them advances so that `updated_at` keeps aging for a stalled job.
    /// Returns `false` when nothing was written.
    pub async fn record_progress(
        &self,
        id: JobId,
        size: i64,
        percent: Option<i16>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp_millis();
        let size = size.max(0);
        let percent = percent.map(|p| p.clamp(0, 100));
        let pool = &self.pool;
        let done = self
            .retrying("record_progress", move || async move {
                sqlx::query(
                    "UPDATE jobs SET progress_size = MAX(progress_size, ?), \
                     progress_percent = COALESCE(MAX(progress_percent, ?), progress_percent), \
                     updated_at = ? \
                     WHERE id = ? AND status = 'in_progress' \
                     AND (progress_size < ? OR progress_percent < COALESCE(?, progress_percent))",
                )
                .bind(size)
                .bind(percent)
                .bind(now)
                .bind(id)
                .bind(size)
                .bind(percent)
                .execute(pool)
                .await
            })
            .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Stores the OS pid of the child a Worker launched for `handle`.
    pub async fn record_pid(
        &self,
        id: JobId,
        handle: ProcessHandle,
        pid: u32,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp_millis();
        let pool = &self.pool;
        let handle = handle.to_string();
        let handle = handle.as_str();
        let done = self
            .retrying("record_pid", move || async move {
                sqlx::query(
                    "UPDATE jobs SET pid = ?, updated_at = ? \
                     WHERE id = ? AND status = 'in_progress' AND process_handle = ?",
                )
                .bind(i64::from(pid))
                .bind(now)
                .bind(id)
                .bind(handle)
                .execute(pool)
                .await
            })
            .await?;
        Ok(done.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Priority;
    use assert_matches::assert_matches;

    async fn memory_store() -> DbHandle {
        DbHandle::new(
            "sqlite::memory:",
            StoreOptions {
                max_connections: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_rejects_second_active_job() {
        let db = memory_store().await;
        db.create(&EnqueueRequest::new("R1")).await.unwrap();
        assert_matches!(
            db.create(&EnqueueRequest::new("R1")).await,
            Err(StoreError::ActiveJobExists(resource)) if resource == "R1"
        );
    }

    #[tokio::test]
    async fn terminal_job_allows_new_active_job() {
        let db = memory_store().await;
        let first = db.create(&EnqueueRequest::new("R1")).await.unwrap();
        db.apply(first, Transition::Cancel).await.unwrap();
        let second = db.create(&EnqueueRequest::new("R1")).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn find_orders_by_priority_then_age_then_id() {
        let db = memory_store().await;
        let low = db
            .create(&EnqueueRequest::new("a").priority(Priority::new(7).unwrap()))
            .await
            .unwrap();
        let high = db
            .create(&EnqueueRequest::new("b").priority(Priority::HIGHEST))
            .await
            .unwrap();
        let mid_first = db.create(&EnqueueRequest::new("c")).await.unwrap();
        let mid_second = db.create(&EnqueueRequest::new("d")).await.unwrap();

        let ids: Vec<_> = db
            .find(&JobQuery::with_status(JobStatus::Pending))
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(ids, vec![high, mid_first, mid_second, low]);

        let limited = db
            .find(&JobQuery::with_status(JobStatus::Pending).limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, high);
    }

    #[tokio::test]
    async fn storage_rejects_unknown_status() {
        let db = memory_store().await;
        let id = db.create(&EnqueueRequest::new("R1")).await.unwrap();
        let result = sqlx::query("UPDATE jobs SET status = 'Processing' WHERE id = ?")
            .bind(id)
            .execute(db.pool())
            .await;
        assert!(result.is_err());
        assert_eq!(db.get(id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_only_for_running_jobs() {
        let db = memory_store().await;
        let id = db.create(&EnqueueRequest::new("R1")).await.unwrap();
        assert!(!db.record_progress(id, 10, None).await.unwrap());

        db.apply(id, Transition::Admit { handle: ProcessHandle::new() })
            .await
            .unwrap();
        assert!(db.record_progress(id, 100, Some(40)).await.unwrap());
        assert!(!db.record_progress(id, 50, Some(20)).await.unwrap());
        assert!(db.record_progress(id, 120, None).await.unwrap());
        assert!(db.record_progress(id, 120, Some(45)).await.unwrap());

        let job = db.get(id).await.unwrap().unwrap();
        assert_eq!(job.progress_size, 120);
        assert_eq!(job.progress_percent, 45);
    }

    #[tokio::test]
    async fn repeated_progress_leaves_updated_at_alone() {
        let db = memory_store().await;
        let id = db.create(&EnqueueRequest::new("R1")).await.unwrap();
        db.apply(id, Transition::Admit { handle: ProcessHandle::new() })
            .await
            .unwrap();
        assert!(db.record_progress(id, 64, Some(10)).await.unwrap());
        let before = db.get(id).await.unwrap().unwrap().updated_at;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!db.record_progress(id, 64, Some(10)).await.unwrap());
        assert!(!db.record_progress(id, 64, None).await.unwrap());
        assert_eq!(db.get(id).await.unwrap().unwrap().updated_at, before);
    }

    fn flaky_store(db: DbHandle, retries: u32) -> DbHandle {
        DbHandle {
            options: StoreOptions {
                retries,
                backoff: Duration::from_millis(1),
                ..db.options
            },
            ..db
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let db = flaky_store(memory_store().await, 3);
        let mut calls = 0;
        let result = db
            .retrying("flaky", || {
                calls += 1;
                let failing = calls <= 2;
                async move {
                    if failing {
                        Err(sqlx::Error::PoolTimedOut)
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_matches!(result, Ok(7));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_unavailable() {
        let db = flaky_store(memory_store().await, 2);
        let mut calls = 0;
        let result: Result<(), _> = db
            .retrying("down", || {
                calls += 1;
                async { Err(sqlx::Error::PoolTimedOut) }
            })
            .await;
        assert_matches!(
            result,
            Err(StoreError::Unavailable {
                attempts: 3,
                source: sqlx::Error::PoolTimedOut
            })
        );
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let db = flaky_store(memory_store().await, 5);
        let pool = db.pool().clone();
        let mut calls = 0;
        let result = db
            .retrying("broken", || {
                calls += 1;
                let pool = pool.clone();
                async move { sqlx::query("SELEC nothing").execute(&pool).await }
            })
            .await;
        assert_matches!(result, Err(StoreError::Database(sqlx::Error::Database(_))));
        assert_eq!(calls, 1);
    }
}
