//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use audioq::db::{DbHandle, StoreOptions};
use audioq::partial::OutputLayout;
use audioq::worker::{ToolCommand, Worker};
use audioq::{EnqueueRequest, Job, ProcessHandle, Transition, TransitionOutcome};
use std::future::Future;
use std::time::Duration;
use tempfile::TempDir;

pub struct Fixture {
    pub dir: TempDir,
    pub store: DbHandle,
    pub layout: OutputLayout,
}

impl Fixture {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let store = DbHandle::new(
            &url,
            StoreOptions {
                backoff: Duration::from_millis(10),
                ..Default::default()
            },
        )
        .await
        .expect("open store");
        let layout = OutputLayout::new(dir.path().join("out"), "mp3");
        Fixture { dir, store, layout }
    }

    pub fn worker(&self, tool: ToolCommand, timeout: Duration) -> Worker {
        Worker::new(self.store.clone(), tool, self.layout.clone(), timeout)
    }

    /// Creates a job and moves it to in_progress under a fresh handle.
    pub async fn running_job(&self, resource_id: &str) -> (Job, ProcessHandle) {
        let id = self
            .store
            .create(&EnqueueRequest::new(resource_id))
            .await
            .expect("create");
        let handle = ProcessHandle::new();
        match self.store.apply(id, Transition::Admit { handle }).await {
            Ok(TransitionOutcome::Applied(job)) => (job, handle),
            other => panic!("admit failed: {other:?}"),
        }
    }

    pub async fn job(&self, id: audioq::JobId) -> Job {
        self.store.get(id).await.expect("get").expect("job exists")
    }
}

/// Runs `script` under `sh -c` with `$1` = resource id, `$2` = artifact
/// path and `$3` = partial path.
pub fn sh(script: &str) -> ToolCommand {
    ToolCommand::new(
        "sh",
        ["-c", script, "sh", "{resource_id}", "{output}", "{partial}"],
    )
}

/// Writes the artifact and exits 0.
pub fn succeeding_tool() -> ToolCommand {
    sh(r#"printf 'audio-bytes' > "$2""#)
}

/// Grows the partial file in a few steps before renaming it to the artifact.
pub fn growing_tool(steps: u32, pause: &str) -> ToolCommand {
    sh(&format!(
        r#"for i in $(seq 1 {steps}); do printf '0123456789abcdef' >> "$3"; sleep {pause}; done; mv "$3" "$2""#
    ))
}

/// Polls `check` until it returns true or `limit` runs out.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
