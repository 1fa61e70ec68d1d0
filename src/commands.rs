use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cli::Mode;
use rdlink::downloader::SharedRateLimiter;
use rdlink::naming;
use rdlink::{
    Config, Download, DownloadError, DownloadEvent, DownloadStatus, DownloadStore, Downloader,
    EventReceiver, EventSender, HttpDownloader, PathResolver, SymlinkDownloader,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub path: String,
    pub link: Option<String>,
    pub sha256: Option<String>,
}

pub struct RunOptions {
    pub config: Config,
    pub mode: Mode,
    /// Folder the logical paths are materialized under.
    pub download_dir: PathBuf,
    pub state_file: PathBuf,
    pub concurrency: usize,
}

struct RunContext {
    store: DownloadStore,
    config: Config,
    mode: Mode,
    download_dir: PathBuf,
    resolver: Arc<PathResolver>,
    client: reqwest::Client,
    rate_limiter: Option<Arc<SharedRateLimiter>>,
    multi_progress: MultiProgress,
    shutdown: CancellationToken,
}

/// Parses `path|link|sha256` lines; blank lines and `#` comments are skipped.
/// Without a path the file name is taken from the link.
pub fn parse_tasks(content: &str) -> Vec<Task> {
    let optional = |s: Option<&str>| s.map(str::trim).filter(|s| !s.is_empty()).map(String::from);

    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut parts = line.splitn(3, '|');
            let path = parts.next().unwrap_or_default().trim();
            let link = optional(parts.next());
            let sha256 = optional(parts.next());
            let path = if path.is_empty() {
                let name = link.as_deref().and_then(naming::filename_from_url)?;
                naming::sanitize_filename(&name)
            } else {
                path.to_string()
            };
            Some(Task { path, link, sha256 })
        })
        .collect()
}

pub async fn read_tasks(input: &Path) -> Result<Vec<Task>> {
    let file = fs::File::open(input)
        .await
        .with_context(|| format!("Failed to open tasks file: {:?}", input))?;
    let mut lines = BufReader::new(file).lines();
    let mut content = String::new();
    while let Some(line) = lines.next_line().await? {
        content.push_str(&line);
        content.push('\n');
    }
    Ok(parse_tasks(&content))
}

pub async fn run_downloads(tasks: Vec<Task>, options: RunOptions) -> Result<()> {
    if tasks.is_empty() {
        println!("Nothing to download.");
        return Ok(());
    }
    if !options.download_dir.exists() {
        fs::create_dir_all(&options.download_dir)
            .await
            .context("Failed to create download directory")?;
    }

    let store = DownloadStore::open(&options.state_file)
        .await
        .with_context(|| format!("Failed to open state file {:?}", options.state_file))?;

    let client = HttpDownloader::build_client(&options.config.transfer)
        .context("Failed to build HTTP client")?;
    let rate_limiter = options
        .config
        .transfer
        .rate_limit
        .and_then(std::num::NonZeroU32::new)
        .map(|limit| Arc::new(SharedRateLimiter::per_second(limit)));

    let multi_progress = MultiProgress::new();
    multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));

    let shutdown = CancellationToken::new();
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling downloads");
            on_ctrl_c.cancel();
        }
    });

    let downloads = prepare_downloads(&store, &tasks).await?;
    let total = downloads.len();

    let ctx = Arc::new(RunContext {
        store,
        resolver: Arc::new(PathResolver::new(options.config.resolver.clone())),
        config: options.config,
        mode: options.mode,
        download_dir: options.download_dir,
        client,
        rate_limiter,
        multi_progress,
        shutdown,
    });

    let semaphore = Arc::new(Semaphore::new(options.concurrency));
    let mut handles = vec![];

    for (download, task) in downloads {
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            let path = download.path.clone();
            match process_download(&ctx, download, &task).await {
                Ok(()) => Some(true),
                Err(e) => {
                    error!("Failed to download {}: {:#}", path, e);
                    Some(false)
                }
            }
        }));
    }

    let mut completed = 0;
    for handle in handles {
        if let Ok(Some(true)) = handle.await {
            completed += 1;
        }
    }

    println!("Summary: Files: {}/{} | Failed: {}", completed, total, total - completed);
    Ok(())
}

/// Creates records for new tasks and re-queues unfinished ones from an
/// earlier run. Completed downloads are skipped.
async fn prepare_downloads(store: &DownloadStore, tasks: &[Task]) -> Result<Vec<(Download, Task)>> {
    let existing = store.all().await;
    let find = |path: &str| existing.iter().rev().find(|d| d.path == path).cloned();

    let torrent_id = tasks
        .iter()
        .find_map(|t| find(&t.path))
        .map(|d| d.torrent_id)
        .unwrap_or_else(Uuid::new_v4);

    let mut downloads = Vec::with_capacity(tasks.len());
    for task in tasks {
        let download = match find(&task.path) {
            Some(d) if d.status() == DownloadStatus::Completed => {
                println!("Skipped     {} (completed {})", d.path, format_time(d.completed));
                continue;
            }
            Some(d) => {
                store.reset(d.download_id).await?;
                d
            }
            None => store.create(torrent_id, &task.path).await?,
        };
        if let Some(link) = &task.link {
            store.update_link(download.download_id, link).await?;
        }
        downloads.push((download, task.clone()));
    }
    Ok(downloads)
}

async fn process_download(ctx: &RunContext, download: Download, task: &Task) -> Result<()> {
    let id = download.download_id;
    let store = &ctx.store;
    let mut retry_count = 0;

    loop {
        store.update_download_started(id, Some(Utc::now())).await?;

        match run_once(ctx, &download, task).await {
            Ok(path) => {
                let now = Utc::now();
                store.update_download_finished(id, Some(now)).await?;
                store.update_error(id, None).await?;
                store.update_completed(id, Some(now)).await?;
                info!("Materialized {} at {}", download.path, path.display());
                return Ok(());
            }
            Err(e) => {
                retry_count += 1;
                store.update_retry_count(id, retry_count).await?;

                if e.is_retryable()
                    && ctx.config.retry.should_retry(retry_count)
                    && !ctx.shutdown.is_cancelled()
                {
                    warn!(
                        "Download of {} failed ({}), retrying {}/{}",
                        download.path, e, retry_count, ctx.config.retry.max_download_attempts
                    );
                    store.update_download_started(id, None).await?;
                    continue;
                }

                store.update_error(id, Some(e.to_string())).await?;
                return Err(e.into());
            }
        }
    }
}

fn build_downloader(
    ctx: &RunContext,
    download: &Download,
    task: &Task,
) -> Result<Arc<dyn Downloader>, DownloadError> {
    let destination = destination_for(&ctx.download_dir, &download.path, ctx.mode);
    let link = task.link.clone().or_else(|| download.link.clone());

    let downloader: Arc<dyn Downloader> = match ctx.mode {
        Mode::Symlink => Arc::new(SymlinkDownloader::new(
            link.unwrap_or_default(),
            destination,
            download.path.clone(),
            ctx.resolver.clone(),
        )),
        Mode::Http => {
            let link = link.ok_or(DownloadError::MissingLink)?;
            Arc::new(
                HttpDownloader::new(ctx.client.clone(), link, destination)
                    .with_expected_sha256(task.sha256.clone())
                    .with_rate_limiter(ctx.rate_limiter.clone()),
            )
        }
    };
    Ok(downloader)
}

/// Where a download lands under the download folder. Only plain name
/// segments of the logical path are used. Symlink downloads get a folder of
/// their own named after the item, because that folder becomes the link.
fn destination_for(download_dir: &Path, logical_path: &str, mode: Mode) -> PathBuf {
    let logical = naming::LogicalPath::parse(logical_path);
    let mut destination = download_dir.to_path_buf();
    for component in Path::new(&logical.parent_path).components() {
        if let Component::Normal(name) = component {
            destination.push(name);
        }
    }
    if mode == Mode::Symlink {
        destination.push(&logical.file_name_without_extension);
    }
    destination.join(&logical.file_name)
}

async fn run_once(
    ctx: &RunContext,
    download: &Download,
    task: &Task,
) -> Result<PathBuf, DownloadError> {
    let downloader = build_downloader(ctx, download, task)?;

    let pb = ctx.multi_progress.add(ProgressBar::new(0));
    pb.set_style(progress_style(ctx.mode));
    pb.set_message(download.path.clone());

    let (events, rx) = EventSender::channel();
    let render = tokio::spawn(render_events(rx, pb, download.path.clone()));

    let cancel_on_shutdown = {
        let downloader = downloader.clone();
        let shutdown = ctx.shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            downloader.cancel().await;
        })
    };

    let outcome = downloader.start(events).await;
    cancel_on_shutdown.abort();
    let _ = render.await;
    outcome
}

fn progress_style(mode: Mode) -> ProgressStyle {
    let template = match mode {
        Mode::Symlink => concat!(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] ",
            "search {pos:>2}/{len:<2} {msg}"
        ),
        Mode::Http => concat!(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] ",
            "{bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}"
        ),
    };
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

async fn render_events(mut rx: EventReceiver, pb: ProgressBar, name: String) {
    while let Some(event) = rx.recv().await {
        match event {
            DownloadEvent::Progress(p) => {
                pb.set_length(p.bytes_total);
                pb.set_position(p.bytes_done);
            }
            DownloadEvent::Completed { path } => {
                pb.finish_with_message(format!("Completed   {} -> {}", name, path.display()));
            }
            DownloadEvent::Failed { message, .. } => {
                pb.abandon_with_message(format!("Failed      {}: {}", name, message));
            }
        }
    }
}

pub async fn list_downloads(state_file: &Path) -> Result<()> {
    if !state_file.exists() {
        println!("State file '{:?}' does not exist.", state_file);
        println!("Tip: If you used a custom state file, please specify it with --state-file");
        return Ok(());
    }

    let store = DownloadStore::open(state_file).await?;
    let downloads = store.all().await;
    if downloads.is_empty() {
        println!("No downloads found in '{:?}'.", state_file);
        return Ok(());
    }

    let completed = downloads
        .iter()
        .filter(|d| d.status() == DownloadStatus::Completed)
        .count();
    let errored = downloads
        .iter()
        .filter(|d| d.status() == DownloadStatus::Errored)
        .count();
    println!(
        "Summary: Files: {}/{} | Errors: {} | State: {}",
        completed,
        downloads.len(),
        errored,
        HumanBytes(fs::metadata(state_file).await.map(|m| m.len()).unwrap_or(0))
    );
    println!();

    println!("{:<36} {:<50} {:<12} {:<8} {:<17}", "Id", "Path", "Status", "Retries", "Updated");
    println!("{:-<36} {:-<50} {:-<12} {:-<8} {:-<17}", "", "", "", "", "");

    for d in &downloads {
        let updated = d
            .completed
            .or(d.download_finished)
            .or(d.download_started)
            .or(d.added);
        println!(
            "{:<36} {:<50} {:<12} {:<8} {:<17}",
            d.download_id,
            d.path,
            d.status(),
            d.retry_count,
            format_time(updated)
        );
        if let Some(err) = &d.error {
            println!("{:<36} {}", "", err);
        }
    }

    Ok(())
}

pub async fn reset_download(state_file: &Path, download_id: Uuid) -> Result<()> {
    let store = DownloadStore::open(state_file).await?;
    store
        .reset(download_id)
        .await
        .with_context(|| format!("Failed to reset download {}", download_id))?;
    println!("Reset download {}", download_id);
    Ok(())
}

fn format_time(at: Option<chrono::DateTime<Utc>>) -> String {
    at.map(|t| {
        t.with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M")
            .to_string()
    })
    .unwrap_or_else(|| "-".to_string())
}
