use anyhow::{anyhow, Error};
use clap::Parser;

use audioq::admission::JobQueue;
use audioq::config::{Command, Config};
use audioq::db::DbHandle;
use audioq::{server, telemetry, EnqueueRequest, Job, Priority};
use std::env;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, instrument, Instrument};

#[instrument(skip_all)]
async fn setup(config: Config, cancel_token: CancellationToken) -> Result<(), Error> {
    debug!("Connecting to db:{}", config.database_url);
    let store = DbHandle::new(&config.database_url, config.store_options()).await?;
    let queue = JobQueue::new(store.clone());

    match config.command {
        Command::Run(args) => {
            server::serve(cancel_token, store, args.server_config())
                .instrument(info_span!("server"))
                .await?;
        }
        Command::Enqueue {
            resource_id,
            priority,
            expected_size,
        } => {
            let priority = Priority::new(priority)
                .ok_or_else(|| anyhow!("priority {priority} is outside 1..=9"))?;
            let mut request = EnqueueRequest::new(resource_id).priority(priority);
            request.expected_size = expected_size;
            let job_id = queue.enqueue_with(request).await?;
            println!("{job_id}");
        }
        Command::Status { job_id } => match queue.get_job(job_id).await? {
            Some(job) => print_job(&job),
            None => return Err(anyhow!("job {job_id} not found")),
        },
        Command::Active { resource_id } => match queue.get_active_job(&resource_id).await? {
            Some(job_id) => println!("{job_id}"),
            None => println!("none"),
        },
        Command::Cancel { job_id } => {
            if queue.cancel(job_id).await? {
                println!("cancelled {job_id}");
            } else {
                println!("job {job_id} already finished");
            }
        }
    }

    Ok(())
}

fn print_job(job: &Job) {
    println!("id:          {}", job.id);
    println!("resource:    {}", job.resource_id);
    println!("status:      {}", job.status);
    println!("priority:    {}", job.priority);
    println!(
        "progress:    {}% ({} bytes)",
        job.progress_percent, job.progress_size
    );
    if let Some(error) = &job.error_message {
        println!("error:       {error}");
    }
    println!("created:     {}", job.created_at);
    println!("updated:     {}", job.updated_at);
    if let Some(completed) = job.completed_at {
        println!("completed:   {completed}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "audioq=debug");
    }

    let config = Config::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {eprintln!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {eprintln!("Received SIGINT"); token.cancel()},
        }
    });

    let result = app.await?;
    telemetry::shutdown();
    result?;

    Ok(())
}
