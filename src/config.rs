use crate::db::StoreOptions;
use crate::dispatcher::DispatcherConfig;
use crate::partial::OutputLayout;
use crate::server::ServerConfig;
use crate::watcher::WatcherConfig;
use crate::worker::ToolCommand;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about)]
pub struct Config {
    #[arg(
        short = 'c',
        long = "database_url",
        env = "AUDIOQ_DATABASE_URL",
        help = "SQLite Connection URL",
        default_value = "sqlite://audioq.db"
    )]
    pub database_url: String,

    #[arg(
        long = "max_connections",
        env = "AUDIOQ_MAX_CONNECTIONS",
        help = "Job store connection pool size",
        default_value_t = 5
    )]
    pub max_connections: u32,

    #[arg(
        long = "store_retries",
        env = "AUDIOQ_STORE_RETRIES",
        help = "Retries after a transient job store error",
        default_value_t = 5
    )]
    pub store_retries: u32,

    #[arg(
        long = "store_backoff_ms",
        env = "AUDIOQ_STORE_BACKOFF_MS",
        help = "First retry delay, doubled per retry",
        default_value_t = 100
    )]
    pub store_backoff_ms: u64,

    #[arg(
        long = "jaeger_endpoint",
        env = "AUDIOQ_JAEGER_ENDPOINT",
        help = "Jaeger collector endpoint, e.g. http://jaeger:14268/api/traces"
    )]
    pub jaeger_endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_connections: self.max_connections.max(1),
            retries: self.store_retries,
            backoff: Duration::from_millis(self.store_backoff_ms),
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum Command {
    /// Run the dispatcher and the progress watcher until interrupted
    Run(RunArgs),
    /// Queue a resource, or print the job already queued for it
    Enqueue {
        resource_id: String,
        #[arg(short = 'p', long, default_value_t = 5)]
        priority: i16,
        #[arg(long = "expected_size")]
        expected_size: Option<i64>,
    },
    /// Show a job
    Status { job_id: i64 },
    /// Show the pending or running job for a resource
    Active { resource_id: String },
    /// Cancel a pending or running job
    Cancel { job_id: i64 },
}

#[derive(Args, Clone, Debug, PartialEq)]
pub struct RunArgs {
    #[arg(
        short = 'n',
        long = "number_active",
        env = "AUDIOQ_NUMBER_ACTIVE",
        help = "Number of Active Jobs in Parallel",
        default_value = "3"
    )]
    pub num: u16,

    #[arg(long = "poll_interval_ms", env = "AUDIOQ_POLL_INTERVAL_MS", default_value_t = 2000)]
    pub poll_interval_ms: u64,

    #[arg(
        long = "orphan_grace_ms",
        env = "AUDIOQ_ORPHAN_GRACE_MS",
        help = "Defaults to twice the poll interval"
    )]
    pub orphan_grace_ms: Option<u64>,

    #[arg(long = "watch_interval_ms", env = "AUDIOQ_WATCH_INTERVAL_MS", default_value_t = 1000)]
    pub watch_interval_ms: u64,

    #[arg(long = "debounce_ms", env = "AUDIOQ_DEBOUNCE_MS", default_value_t = 10_000)]
    pub debounce_ms: u64,

    #[arg(long = "job_timeout_secs", env = "AUDIOQ_JOB_TIMEOUT_SECS", default_value_t = 3600)]
    pub job_timeout_secs: u64,

    #[arg(long = "output_dir", env = "AUDIOQ_OUTPUT_DIR", default_value = "downloads")]
    pub output_dir: PathBuf,

    #[arg(long = "extension", env = "AUDIOQ_EXTENSION", default_value = "mp3")]
    pub extension: String,

    #[arg(long = "no_startup_recovery", help = "Leave in-progress jobs to the orphan sweep")]
    pub no_startup_recovery: bool,

    #[arg(long = "tool", env = "AUDIOQ_TOOL", help = "Download/conversion program")]
    pub tool: String,

    #[arg(
        last = true,
        help = "Tool arguments; {resource_id}, {output} and {partial} are substituted"
    )]
    pub tool_args: Vec<String>,
}

impl RunArgs {
    pub fn server_config(&self) -> ServerConfig {
        let poll_interval = Duration::from_millis(self.poll_interval_ms.max(1));
        let mut dispatcher = DispatcherConfig::new(usize::from(self.num.max(1)), poll_interval);
        if let Some(grace) = self.orphan_grace_ms {
            dispatcher.orphan_grace = Duration::from_millis(grace);
        }
        dispatcher.recover_on_start = !self.no_startup_recovery;

        let tool_args = if self.tool_args.is_empty() {
            vec!["{resource_id}".to_string(), "{output}".to_string()]
        } else {
            self.tool_args.clone()
        };

        ServerConfig {
            dispatcher,
            watcher: WatcherConfig {
                poll_interval: Duration::from_millis(self.watch_interval_ms.max(1)),
                debounce: Duration::from_millis(self.debounce_ms),
            },
            layout: OutputLayout::new(&self.output_dir, self.extension.as_str()),
            tool: ToolCommand::new(self.tool.as_str(), tool_args),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
        }
    }
}
