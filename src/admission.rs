//! The only write path open to outside callers.

use crate::db::DbHandle;
use crate::error::{AdmissionError, StoreError};
use crate::status::{Transition, TransitionOutcome};
use crate::{EnqueueRequest, Job, JobId, Priority};
use tracing::*;

/// How many times a lost enqueue race is retried before giving up. The race
/// only loops when the competing job finishes between the insert and the
/// lookup.
const ENQUEUE_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct JobQueue {
    store: DbHandle,
}

impl JobQueue {
    pub fn new(store: DbHandle) -> Self {
        JobQueue { store }
    }

    /// Queues `resource_id` at the given priority, or returns the job that is
    /// already pending or running for it.
    pub async fn enqueue(&self, resource_id: &str, priority: i16) -> Result<JobId, AdmissionError> {
        let priority = Priority::new(priority).ok_or(AdmissionError::InvalidPriority(priority))?;
        self.enqueue_with(EnqueueRequest::new(resource_id).priority(priority))
            .await
    }

    #[instrument(skip_all, fields(resource_id = %request.resource_id, priority = %request.priority))]
    pub async fn enqueue_with(&self, request: EnqueueRequest) -> Result<JobId, AdmissionError> {
        if request.resource_id.is_empty() {
            return Err(AdmissionError::EmptyResource);
        }
        if let Some(size) = request.expected_size.filter(|size| *size <= 0) {
            return Err(AdmissionError::InvalidExpectedSize(size));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(job) = self.store.active_job(&request.resource_id).await? {
                debug!(job_id = job.id, status = %job.status, "Resource already queued");
                return Ok(job.id);
            }
            match self.store.create(&request).await {
                Ok(id) => {
                    info!(job_id = id, "Enqueued job");
                    return Ok(id);
                }
                Err(StoreError::ActiveJobExists(_)) if attempt < ENQUEUE_ATTEMPTS => {
                    debug!(attempt, "Lost enqueue race, looking up winner");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.store.get(id).await
    }

    pub async fn get_active_job(&self, resource_id: &str) -> Result<Option<JobId>, StoreError> {
        Ok(self.store.active_job(resource_id).await?.map(|job| job.id))
    }

    /// Cancels a pending or running job. Returns `false` when the job had
    /// already finished.
    pub async fn cancel(&self, id: JobId) -> Result<bool, StoreError> {
        match self.store.apply(id, Transition::Cancel).await? {
            TransitionOutcome::Applied(_) => {
                info!(job_id = id, "Cancelled job");
                Ok(true)
            }
            TransitionOutcome::Ignored(status) => {
                debug!(job_id = id, %status, "Job already finished, nothing to cancel");
                Ok(false)
            }
        }
    }
}
