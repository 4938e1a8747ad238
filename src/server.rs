use crate::db::DbHandle;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::partial::OutputLayout;
use crate::watcher::{ProgressWatcher, WatcherConfig};
use crate::worker::{ToolCommand, Worker};
use anyhow::Error;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub dispatcher: DispatcherConfig,
    pub watcher: WatcherConfig,
    pub layout: OutputLayout,
    pub tool: ToolCommand,
    pub job_timeout: Duration,
}

/// Runs the dispatcher and the progress watcher side by side until the
/// token is cancelled. If the dispatcher stops on its own the watcher is
/// stopped too.
pub async fn serve(
    cancel_token: CancellationToken,
    store: DbHandle,
    config: ServerConfig,
) -> Result<(), Error> {
    let worker = Worker::new(
        store.clone(),
        config.tool,
        config.layout.clone(),
        config.job_timeout,
    );
    let mut dispatcher = Dispatcher::new(
        store.clone(),
        worker,
        config.dispatcher,
        cancel_token.clone(),
    );
    let mut watcher = ProgressWatcher::new(store, config.layout, config.watcher, cancel_token.clone());

    let watcher_task = tokio::spawn(
        async move {
            watcher.run().await;
        }
        .instrument(info_span!("watcher")),
    );
    let dispatcher_task = tokio::spawn(
        async move { dispatcher.run().await }.instrument(info_span!("dispatcher")),
    );

    let dispatched = dispatcher_task.await;
    if !cancel_token.is_cancelled() {
        error!("Dispatcher exited unexpectedly, stopping");
        cancel_token.cancel();
    }
    watcher_task.await?;
    dispatched??;

    info!("Server stopped.");

    Ok(())
}
