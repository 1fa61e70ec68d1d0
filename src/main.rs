mod cli;
mod commands;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use uuid::Uuid;

use crate::cli::{LogLevel, Mode};
use crate::commands::{RunOptions, Task};
use rdlink::{Config, ResolverConfig, RetryPolicy, TransferConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Single logical path to materialize (tasks-file is ignored when given)
    #[arg(index = 1)]
    path: Option<String>,

    /// Unrestricted link for the single path (required in http mode)
    #[arg(long)]
    link: Option<String>,

    /// File with one task per line: `path|link|sha256`, link and hash optional
    #[arg(short = 't', long = "tasks-file", default_value = "download.txt")]
    tasks_file: PathBuf,

    /// Directory where downloads are materialized
    #[arg(
        short = 'd',
        long = "download-dir",
        default_value = "downloads",
        env = "RDLINK_DOWNLOAD_DIR"
    )]
    download_dir: PathBuf,

    /// Folder name under the download directory (defaults to the tasks file or item name)
    #[arg(short = 'n', long = "name")]
    name: Option<String>,

    /// Where the remote filesystem is mounted
    #[arg(
        short = 'm',
        long = "mount-root",
        default_value = "/mnt/remote",
        env = "RDLINK_MOUNT_ROOT"
    )]
    mount_root: PathBuf,

    #[arg(long, value_enum, default_value = "symlink", env = "RDLINK_MODE")]
    mode: Mode,

    /// Maximum number of concurrent downloads (defaults to number of logical CPUs)
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Global rate limit in bytes per second for http mode (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,

    /// Mount search attempts per download
    #[arg(long, default_value_t = rdlink::config::MAX_RETRIES)]
    max_retries: u32,

    /// Backoff unit between mount searches, in milliseconds
    #[arg(long, default_value_t = 1000)]
    backoff_ms: u64,

    /// Extensions the symlink mode refuses (comma separated)
    #[arg(long, value_delimiter = ',', default_value = "zip,rar,tar")]
    disallowed_extensions: Vec<String>,

    /// How many times a failed download is re-queued
    #[arg(long, default_value_t = 3)]
    attempts: u32,

    /// Download records are kept here between runs
    #[arg(
        short = 's',
        long = "state-file",
        default_value = "rdlink.json",
        env = "RDLINK_STATE_FILE"
    )]
    state_file: PathBuf,

    /// List all downloads and their status
    #[arg(short = 'l', long)]
    list: bool,

    /// Reset a download to its queued state
    #[arg(long, value_name = "DOWNLOAD_ID")]
    reset: Option<Uuid>,

    #[arg(long, value_enum, default_value = "info", env = "RDLINK_LOG_LEVEL")]
    log_level: LogLevel,

    /// Also write debug logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            resolver: ResolverConfig {
                mount_root: self.mount_root.clone(),
                disallowed_extensions: self
                    .disallowed_extensions
                    .iter()
                    .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                    .filter(|e| !e.is_empty())
                    .collect(),
                max_retries: self.max_retries,
                backoff_step: Duration::from_millis(self.backoff_ms),
            },
            transfer: TransferConfig {
                rate_limit: self.rate_limit,
                ..TransferConfig::default()
            },
            retry: RetryPolicy {
                max_download_attempts: self.attempts,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    rdlink::logging::init_tracing(args.log_level.as_tracing_level(), args.log_file.as_deref())?;

    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }

    if args.list {
        return commands::list_downloads(&args.state_file).await;
    }

    if let Some(download_id) = args.reset {
        return commands::reset_download(&args.state_file, download_id).await;
    }

    let (tasks, default_name) = match &args.path {
        Some(path) => {
            let task = Task {
                path: path.clone(),
                link: args.link.clone(),
                sha256: None,
            };
            let name = rdlink::naming::LogicalPath::parse(path).file_name_without_extension;
            (vec![task], name)
        }
        None => {
            let tasks = commands::read_tasks(&args.tasks_file).await?;
            let name = args
                .tasks_file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "downloads".to_string());
            (tasks, name)
        }
    };

    let options = RunOptions {
        config: args.config(),
        mode: args.mode,
        download_dir: args.download_dir.join(args.name.clone().unwrap_or(default_name)),
        state_file: args.state_file.clone(),
        concurrency: args.concurrency.unwrap_or_else(num_cpus::get).max(1),
    };

    commands::run_downloads(tasks, options).await
}
