//! Bounded-concurrency scheduling loop.
//!
//! Every tick reaps finished Workers, admits pending jobs up to the
//! concurrency cap, and requeues in-progress jobs whose Worker is gone.
//! The set of running Workers lives only in this loop, so a single
//! dispatcher may run against a store at a time.

use crate::db::{DbHandle, JobQuery};
use crate::error::StoreError;
use crate::status::{JobStatus, Transition, TransitionOutcome};
use crate::worker::{WorkOutcome, Worker};
use crate::{Job, JobId, ProcessHandle};
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// How long an untracked in-progress job may go without updates before
    /// it is requeued.
    pub orphan_grace: Duration,
    /// Requeue every in-progress job once at startup.
    pub recover_on_start: bool,
}

impl DispatcherConfig {
    pub fn new(concurrency: usize, poll_interval: Duration) -> Self {
        DispatcherConfig {
            concurrency,
            poll_interval,
            orphan_grace: poll_interval * 2,
            recover_on_start: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub reaped: usize,
    pub admitted: usize,
    pub recovered: usize,
}

struct Running {
    job_id: JobId,
    resource_id: String,
    cancel: CancellationToken,
    join: JoinHandle<Result<WorkOutcome, StoreError>>,
}

pub struct Dispatcher {
    store: DbHandle,
    worker: Worker,
    config: DispatcherConfig,
    shutdown: CancellationToken,
    running: HashMap<ProcessHandle, Running>,
}

impl Dispatcher {
    pub fn new(
        store: DbHandle,
        worker: Worker,
        config: DispatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Dispatcher {
            store,
            worker,
            config,
            shutdown,
            running: HashMap::new(),
        }
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<_> = self.running.values().map(|run| run.job_id).collect();
        ids.sort_unstable();
        ids
    }

    /// Runs until the shutdown token fires, then stops every Worker and
    /// puts their jobs back in the queue.
    pub async fn run(&mut self) -> Result<(), StoreError> {
        if self.config.recover_on_start {
            self.recover_all().await?;
        }

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            orphan_grace_ms = self.config.orphan_grace.as_millis() as u64,
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Dispatcher cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if report != TickReport::default() => debug!(?report, "Dispatch cycle"),
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "Dispatch cycle failed"),
                    }
                }
            }
        }

        self.stop_all().await;
        info!("Dispatcher stopped.");
        Ok(())
    }

    /// One reap, admit, reconcile pass.
    pub async fn tick(&mut self) -> Result<TickReport, StoreError> {
        let reaped = self.reap().await?;
        self.check_liveness().await?;
        let admitted = self.admit().await?;
        let recovered = self.reconcile().await?;
        Ok(TickReport {
            reaped,
            admitted,
            recovered,
        })
    }

    async fn reap(&mut self) -> Result<usize, StoreError> {
        let finished: Vec<ProcessHandle> = self
            .running
            .iter()
            .filter(|(_, run)| run.join.is_finished())
            .map(|(handle, _)| *handle)
            .collect();

        for handle in &finished {
            if let Some(run) = self.running.remove(handle) {
                let result = run.join.await;
                self.settle(run.job_id, *handle, result).await?;
            }
        }
        Ok(finished.len())
    }

    /// Records what happened to a Worker that has exited.
    async fn settle(
        &self,
        job_id: JobId,
        handle: ProcessHandle,
        result: Result<Result<WorkOutcome, StoreError>, tokio::task::JoinError>,
    ) -> Result<(), StoreError> {
        match result {
            Ok(Ok(WorkOutcome::Interrupted)) => self.requeue_if_owned(job_id, handle).await,
            Ok(Ok(outcome)) => {
                debug!(job_id, ?outcome, "Worker finished");
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(job_id, error = %err, "Worker could not record its result");
                Ok(())
            }
            Err(err) => {
                error!(job_id, error = %err, "Worker task died");
                Ok(())
            }
        }
    }

    async fn requeue_if_owned(&self, job_id: JobId, handle: ProcessHandle) -> Result<(), StoreError> {
        let Some(job) = self.store.get(job_id).await? else {
            return Ok(());
        };
        if job.status != JobStatus::InProgress || job.handle() != Some(handle) {
            return Ok(());
        }
        if let TransitionOutcome::Applied(_) = self.store.apply(job_id, Transition::Requeue).await? {
            info!(job_id, "Requeued interrupted job");
        }
        Ok(())
    }

    /// Asks Workers to stop when their job was cancelled or taken from them.
    async fn check_liveness(&self) -> Result<(), StoreError> {
        for (handle, run) in &self.running {
            if run.cancel.is_cancelled() {
                continue;
            }
            let owned = match self.store.get(run.job_id).await? {
                Some(job) => job.status == JobStatus::InProgress && job.handle() == Some(*handle),
                None => false,
            };
            if !owned {
                info!(job_id = run.job_id, %handle, "Job no longer owned by its Worker, stopping it");
                run.cancel.cancel();
            }
        }
        Ok(())
    }

    async fn admit(&mut self) -> Result<usize, StoreError> {
        let free = self.config.concurrency.saturating_sub(self.running.len());
        if free == 0 {
            return Ok(0);
        }

        let limit = u32::try_from(free).unwrap_or(u32::MAX);
        let candidates = self
            .store
            .find(&JobQuery::with_status(JobStatus::Pending).limit(limit))
            .await?;

        let mut admitted = 0;
        for job in candidates {
            if self.running.len() >= self.config.concurrency {
                break;
            }
            if self.running.values().any(|run| run.resource_id == job.resource_id) {
                debug!(job_id = job.id, resource_id = %job.resource_id, "Resource already running, skipping");
                continue;
            }

            let handle = ProcessHandle::new();
            match self.store.apply(job.id, Transition::Admit { handle }).await {
                Ok(TransitionOutcome::Applied(job)) => {
                    self.spawn(job, handle);
                    admitted += 1;
                }
                Ok(TransitionOutcome::Ignored(status)) => {
                    debug!(job_id = job.id, %status, "Job finished before admission");
                }
                Err(StoreError::IllegalTransition { from, .. }) => {
                    debug!(job_id = job.id, %from, "Job left pending before admission");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(admitted)
    }

    fn spawn(&mut self, job: Job, handle: ProcessHandle) {
        let cancel = self.shutdown.child_token();
        let worker = self.worker.clone();
        let job_id = job.id;
        let resource_id = job.resource_id.clone();
        info!(job_id, %resource_id, priority = %job.priority, %handle, "Admitted job");

        let span = info_span!("worker", job_id, resource_id = %resource_id, %handle);
        let token = cancel.clone();
        let join = tokio::spawn(async move { worker.run(&job, handle, token).await }.instrument(span));

        self.running.insert(
            handle,
            Running {
                job_id,
                resource_id,
                cancel,
                join,
            },
        );
    }

    /// Requeues in-progress jobs that no tracked Worker owns and that have
    /// not been touched within the grace period.
    async fn reconcile(&mut self) -> Result<usize, StoreError> {
        let Some(cutoff) = chrono::Duration::from_std(self.config.orphan_grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
        else {
            return Ok(0);
        };
        let stale = self
            .store
            .find(&JobQuery::with_status(JobStatus::InProgress).updated_before(cutoff))
            .await?;

        let mut recovered = 0;
        for job in stale {
            if job.handle().is_some_and(|handle| self.running.contains_key(&handle)) {
                continue;
            }
            if self.requeue_orphan(&job).await? {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn requeue_orphan(&self, job: &Job) -> Result<bool, StoreError> {
        match self.store.apply(job.id, Transition::Requeue).await {
            Ok(TransitionOutcome::Applied(_)) => {
                warn!(
                    job_id = job.id,
                    resource_id = %job.resource_id,
                    handle = ?job.process_handle,
                    pid = ?job.pid,
                    progress_size = job.progress_size,
                    "Requeued orphaned job"
                );
                Ok(true)
            }
            Ok(TransitionOutcome::Ignored(_)) | Err(StoreError::IllegalTransition { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn recover_all(&mut self) -> Result<(), StoreError> {
        let leftover = self
            .store
            .find(&JobQuery::with_status(JobStatus::InProgress))
            .await?;
        for job in leftover {
            if job.handle().is_some_and(|handle| self.running.contains_key(&handle)) {
                continue;
            }
            self.requeue_orphan(&job).await?;
        }
        Ok(())
    }

    async fn stop_all(&mut self) {
        let running: Vec<_> = self.running.drain().collect();
        for (_, run) in &running {
            run.cancel.cancel();
        }

        let (owners, joins): (Vec<_>, Vec<_>) = running
            .into_iter()
            .map(|(handle, run)| ((run.job_id, handle), run.join))
            .unzip();
        let results = futures::future::join_all(joins).await;

        for ((job_id, handle), result) in owners.into_iter().zip(results) {
            if let Err(err) = self.settle(job_id, handle, result).await {
                error!(job_id, error = %err, "Failed to settle Worker at shutdown");
            }
        }
    }
}
