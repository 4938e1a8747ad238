mod common;

use audioq::watcher::{PollReport, ProgressWatcher, WatcherConfig};
use audioq::{EnqueueRequest, JobStatus, ProcessHandle, Transition};
use common::Fixture;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn watcher(fx: &Fixture, debounce: Duration) -> ProgressWatcher {
    ProgressWatcher::new(
        fx.store.clone(),
        fx.layout.clone(),
        WatcherConfig {
            poll_interval: Duration::from_millis(50),
            debounce,
        },
        CancellationToken::new(),
    )
}

fn append(fx: &Fixture, resource_id: &str, bytes: usize) {
    std::fs::create_dir_all(fx.layout.dir()).unwrap();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(fx.layout.partial_path(resource_id))
        .unwrap();
    file.write_all(&vec![0u8; bytes]).unwrap();
}

#[tokio::test]
async fn pushes_growing_size_into_running_job() {
    let fx = Fixture::new().await;
    let (job, _) = fx.running_job("R1").await;
    let mut watcher = watcher(&fx, Duration::from_secs(60));

    append(&fx, "R1", 100);
    assert_eq!(
        watcher.poll().await.unwrap(),
        PollReport {
            partials: 1,
            lookups: 1,
            writes: 1
        }
    );
    assert_eq!(fx.job(job.id).await.progress_size, 100);

    append(&fx, "R1", 50);
    watcher.poll().await.unwrap();
    let job = fx.job(job.id).await;
    assert_eq!(job.progress_size, 150);
    assert_eq!(job.status, JobStatus::InProgress);
    assert_eq!(job.progress_percent, 0, "no size hint, no percent");
}

#[tokio::test]
async fn unchanged_size_is_debounced() {
    let fx = Fixture::new().await;
    let (job, _) = fx.running_job("R1").await;
    let mut watcher = watcher(&fx, Duration::from_millis(300));

    append(&fx, "R1", 10);
    let report = watcher.poll().await.unwrap();
    assert_eq!((report.lookups, report.writes), (1, 1));
    let report = watcher.poll().await.unwrap();
    assert_eq!((report.lookups, report.writes), (0, 0));

    let touched = fx.job(job.id).await.updated_at;
    tokio::time::sleep(Duration::from_millis(350)).await;
    let report = watcher.poll().await.unwrap();
    assert_eq!((report.lookups, report.writes), (1, 0), "same size is not rewritten");
    assert_eq!(fx.job(job.id).await.updated_at, touched);

    append(&fx, "R1", 5);
    let report = watcher.poll().await.unwrap();
    assert_eq!((report.lookups, report.writes), (1, 1));
}

#[tokio::test]
async fn derives_percent_from_expected_size() {
    let fx = Fixture::new().await;
    let id = fx
        .store
        .create(&EnqueueRequest::new("R1").expected_size(1000))
        .await
        .unwrap();
    fx.store
        .apply(id, Transition::Admit { handle: ProcessHandle::new() })
        .await
        .unwrap();
    let mut watcher = watcher(&fx, Duration::from_secs(60));

    append(&fx, "R1", 250);
    watcher.poll().await.unwrap();
    assert_eq!(fx.job(id).await.progress_percent, 25);

    append(&fx, "R1", 2000);
    watcher.poll().await.unwrap();
    assert_eq!(fx.job(id).await.progress_percent, 99);
}

#[tokio::test]
async fn ignores_jobs_that_are_not_running() {
    let fx = Fixture::new().await;
    let pending = fx.store.create(&EnqueueRequest::new("P")).await.unwrap();
    let mut watcher = watcher(&fx, Duration::from_secs(60));

    append(&fx, "P", 100);
    append(&fx, "nobody", 100);
    let report = watcher.poll().await.unwrap();
    assert_eq!(report.partials, 2);
    assert_eq!(report.writes, 0);
    assert_eq!(fx.job(pending).await.progress_size, 0);
    assert_eq!(fx.job(pending).await.status, JobStatus::Pending);
}

#[tokio::test]
async fn unowned_partials_are_looked_up_once_per_debounce() {
    let fx = Fixture::new().await;
    let mut watcher = watcher(&fx, Duration::from_secs(60));

    append(&fx, "nobody", 100);
    assert_eq!(watcher.poll().await.unwrap().lookups, 1);
    assert_eq!(watcher.tracked(), 1);
    for _ in 0..3 {
        let report = watcher.poll().await.unwrap();
        assert_eq!((report.partials, report.lookups), (1, 0));
    }

    // A job picking the resource up shows through as soon as the file grows.
    let (job, _) = fx.running_job("nobody").await;
    append(&fx, "nobody", 1);
    let report = watcher.poll().await.unwrap();
    assert_eq!((report.lookups, report.writes), (1, 1));
    assert_eq!(fx.job(job.id).await.progress_size, 101);
}

#[tokio::test]
async fn shrinking_file_never_lowers_progress() {
    let fx = Fixture::new().await;
    let (job, _) = fx.running_job("R1").await;
    let mut watcher = watcher(&fx, Duration::from_secs(60));

    append(&fx, "R1", 400);
    watcher.poll().await.unwrap();
    std::fs::write(fx.layout.partial_path("R1"), vec![0u8; 100]).unwrap();
    watcher.poll().await.unwrap();

    assert_eq!(fx.job(job.id).await.progress_size, 400);
}

#[tokio::test]
async fn vanished_partial_stops_tracking_without_completing() {
    let fx = Fixture::new().await;
    let (job, _) = fx.running_job("R1").await;
    let mut watcher = watcher(&fx, Duration::from_secs(60));

    append(&fx, "R1", 100);
    watcher.poll().await.unwrap();
    assert_eq!(watcher.tracked(), 1);

    std::fs::rename(fx.layout.partial_path("R1"), fx.layout.artifact_path("R1")).unwrap();
    let report = watcher.poll().await.unwrap();
    assert_eq!(report.partials, 0);
    assert_eq!(watcher.tracked(), 0);

    let job = fx.job(job.id).await;
    assert_eq!(job.status, JobStatus::InProgress);
    assert_eq!(job.progress_size, 100);
}

#[tokio::test]
async fn run_loop_stops_on_cancel() {
    let fx = Fixture::new().await;
    let (job, _) = fx.running_job("R1").await;
    let shutdown = CancellationToken::new();
    let mut watcher = ProgressWatcher::new(
        fx.store.clone(),
        fx.layout.clone(),
        WatcherConfig {
            poll_interval: Duration::from_millis(20),
            debounce: Duration::from_secs(60),
        },
        shutdown.clone(),
    );
    let run = tokio::spawn(async move { watcher.run().await });

    append(&fx, "R1", 64);
    let store = fx.store.clone();
    let id = job.id;
    assert!(
        common::eventually(Duration::from_secs(3), || {
            let store = store.clone();
            async move { store.get(id).await.unwrap().unwrap().progress_size == 64 }
        })
        .await
    );

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("watcher stops")
        .unwrap();
}
