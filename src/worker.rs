use crate::db::DbHandle;
use crate::error::{StoreError, WorkerError};
use crate::partial::OutputLayout;
use crate::status::{JobStatus, Transition, TransitionOutcome};
use crate::{Job, JobId, ProcessHandle};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::*;

const STDERR_TAIL: usize = 1024;
const STDERR_DRAIN: Duration = Duration::from_secs(1);

/// The external download/conversion tool.
///
/// `{resource_id}`, `{output}` and `{partial}` in any argument are replaced
/// with the job's resource id, artifact path and partial file path.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ToolCommand {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn command(&self, resource_id: &str, output: &Path, partial: &Path) -> Command {
        let output = output.to_string_lossy();
        let partial = partial.to_string_lossy();
        let mut command = Command::new(&self.program);
        for arg in &self.args {
            command.arg(
                arg.replace("{resource_id}", resource_id)
                    .replace("{output}", &output)
                    .replace("{partial}", &partial),
            );
        }
        command
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed,
    Failed,
    /// The Worker was told to stop and killed the tool without finalizing.
    Interrupted,
    /// Someone else already moved the job to a terminal state.
    AlreadyFinal(JobStatus),
}

enum Execution {
    Finished { artifact_size: u64 },
    Interrupted,
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs one job at a time by supervising the external tool.
#[derive(Clone)]
pub struct Worker {
    store: DbHandle,
    tool: ToolCommand,
    layout: OutputLayout,
    timeout: Duration,
}

impl Worker {
    pub fn new(store: DbHandle, tool: ToolCommand, layout: OutputLayout, timeout: Duration) -> Self {
        Worker {
            store,
            tool,
            layout,
            timeout,
        }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Executes `job` and records the result. Returns an error only when the
    /// result could not be written to the store.
    pub async fn run(
        &self,
        job: &Job,
        handle: ProcessHandle,
        cancel: CancellationToken,
    ) -> Result<WorkOutcome, StoreError> {
        match self.execute(job, handle, &cancel).await {
            Ok(Execution::Finished { artifact_size }) => {
                info!(artifact_size, "Tool finished");
                self.finalize(job.id, Ok(artifact_size)).await
            }
            Ok(Execution::Interrupted) => {
                info!("Tool interrupted");
                Ok(WorkOutcome::Interrupted)
            }
            Err(err) => {
                warn!(error = %err, "Job failed");
                self.finalize(job.id, Err(err)).await
            }
        }
    }

    /// Writes the terminal status for a job. Safe to call more than once;
    /// later calls leave the first result in place.
    pub async fn finalize(
        &self,
        id: JobId,
        result: Result<u64, WorkerError>,
    ) -> Result<WorkOutcome, StoreError> {
        let transition = match result {
            Ok(size) => Transition::Complete {
                artifact_size: i64::try_from(size).unwrap_or(i64::MAX),
            },
            Err(err) => Transition::Fail {
                message: err.to_string(),
            },
        };
        match self.store.apply(id, transition).await? {
            TransitionOutcome::Applied(job) if job.status == JobStatus::Completed => {
                Ok(WorkOutcome::Completed)
            }
            TransitionOutcome::Applied(_) => Ok(WorkOutcome::Failed),
            TransitionOutcome::Ignored(status) => {
                debug!(job_id = id, %status, "Job already finalized");
                Ok(WorkOutcome::AlreadyFinal(status))
            }
        }
    }

    async fn execute(
        &self,
        job: &Job,
        handle: ProcessHandle,
        cancel: &CancellationToken,
    ) -> Result<Execution, WorkerError> {
        let artifact = self.layout.artifact_path(&job.resource_id);
        let partial = self.layout.partial_path(&job.resource_id);

        fs::create_dir_all(self.layout.dir()).await?;
        // Leftovers from an earlier attempt must neither pass verification
        // nor feed stale sizes to the progress watcher.
        remove_if_exists(&artifact).await?;
        remove_if_exists(&partial).await?;

        let mut child = self
            .tool
            .command(&job.resource_id, &artifact, &partial)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Launch {
                program: self.tool.program.clone(),
                source,
            })?;

        if let Some(pid) = child.id() {
            debug!(pid, "Tool launched");
            if let Err(err) = self.store.record_pid(job.id, handle, pid).await {
                warn!(pid, error = %err, "Failed to record tool pid");
            }
        }

        let stderr = child.stderr.take().map(|pipe| tokio::spawn(read_tail(pipe)));

        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            _ = sleep(self.timeout) => Wake::TimedOut,
            _ = cancel.cancelled() => Wake::Cancelled,
        };

        let status = match wake {
            Wake::Exited(status) => status?,
            Wake::TimedOut => {
                kill(&mut child).await;
                return Err(WorkerError::Timeout(self.timeout));
            }
            Wake::Cancelled => {
                kill(&mut child).await;
                return Ok(Execution::Interrupted);
            }
        };

        let stderr = match stderr {
            Some(task) => match timeout(STDERR_DRAIN, task).await {
                Ok(Ok(tail)) => tail,
                _ => String::new(),
            },
            None => String::new(),
        };

        if !status.success() {
            return Err(WorkerError::Exit {
                status: status.to_string(),
                stderr,
            });
        }

        match fs::metadata(&artifact).await {
            Ok(meta) if meta.len() > 0 => Ok(Execution::Finished {
                artifact_size: meta.len(),
            }),
            Ok(_) => Err(WorkerError::EmptyArtifact(artifact.display().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(WorkerError::MissingArtifact(artifact.display().to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(err) = child.kill().await {
        warn!(error = %err, "Failed to kill tool");
    }
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Last few hundred bytes of the tool's stderr, trimmed.
async fn read_tail(mut pipe: impl AsyncRead + Unpin) -> String {
    let mut buf = Vec::new();
    if let Err(err) = pipe.read_to_end(&mut buf).await {
        trace!(error = %err, "Failed reading tool stderr");
    }
    let start = buf.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}
