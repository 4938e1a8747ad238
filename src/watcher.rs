//! Out-of-band progress tracking.
//!
//! Polls the output directory for partial files and pushes their sizes into
//! the matching in-progress jobs. It never touches `status`; completion is
//! decided by the Worker alone.

use crate::db::DbHandle;
use crate::error::StoreError;
use crate::partial::OutputLayout;
use crate::status::JobStatus;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    /// Minimum gap between store lookups for a partial whose size has not
    /// changed.
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            poll_interval: Duration::from_secs(1),
            debounce: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub partials: usize,
    pub lookups: usize,
    pub writes: usize,
}

/// Last size seen for a partial file, whether or not a running job owned it.
#[derive(Debug)]
struct Observation {
    size: u64,
    checked_at: Instant,
}

pub struct ProgressWatcher {
    store: DbHandle,
    layout: OutputLayout,
    config: WatcherConfig,
    shutdown: CancellationToken,
    tracked: HashMap<String, Observation>,
}

impl ProgressWatcher {
    pub fn new(
        store: DbHandle,
        layout: OutputLayout,
        config: WatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        ProgressWatcher {
            store,
            layout,
            config,
            shutdown,
            tracked: HashMap::new(),
        }
    }

    pub fn tracked(&self) -> usize {
        self.tracked.len()
    }

    pub async fn run(&mut self) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            dir = %self.layout.dir().display(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Progress watcher started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Progress watcher cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.poll().await {
                        error!(error = %err, "Progress poll failed");
                    }
                }
            }
        }
        info!("Progress watcher stopped.");
    }

    pub async fn poll(&mut self) -> Result<PollReport, StoreError> {
        let partials = match self.layout.scan().await {
            Ok(partials) => partials,
            Err(err) => {
                warn!(dir = %self.layout.dir().display(), error = %err, "Failed to scan output directory");
                return Ok(PollReport::default());
            }
        };

        let mut report = PollReport {
            partials: partials.len(),
            ..Default::default()
        };
        let mut seen = HashSet::with_capacity(partials.len());

        for partial in partials {
            seen.insert(partial.resource_id.clone());

            let due = match self.tracked.get(&partial.resource_id) {
                Some(last) => {
                    last.size != partial.size || last.checked_at.elapsed() >= self.config.debounce
                }
                None => true,
            };
            if !due {
                continue;
            }

            report.lookups += 1;
            let running = self
                .store
                .active_job(&partial.resource_id)
                .await?
                .filter(|job| job.status == JobStatus::InProgress);

            match running {
                Some(job) => {
                    let size = i64::try_from(partial.size).unwrap_or(i64::MAX);
                    let percent = job.expected_size.map(|total| percent_of(size, total));
                    if self.store.record_progress(job.id, size, percent).await? {
                        trace!(job_id = job.id, size, ?percent, "Recorded progress");
                        report.writes += 1;
                    }
                }
                None => trace!(resource_id = %partial.resource_id, "No running job for partial file"),
            }
            self.tracked.insert(
                partial.resource_id,
                Observation {
                    size: partial.size,
                    checked_at: Instant::now(),
                },
            );
        }

        self.tracked.retain(|resource_id, _| {
            let present = seen.contains(resource_id);
            if !present {
                debug!(%resource_id, "Partial file gone, stopped tracking");
            }
            present
        });

        Ok(report)
    }
}

/// Percent of `total` reached by `size`. Capped at 99: only the Worker's
/// finalize writes 100.
fn percent_of(size: i64, total: i64) -> i16 {
    if total <= 0 {
        return 0;
    }
    (i128::from(size) * 100 / i128::from(total)).clamp(0, 99) as i16
}
