use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{header, Client, StatusCode};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Downloader;
use crate::config::TransferConfig;
use crate::error::DownloadError;
use crate::events::EventSender;
use crate::{hashing, naming};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Byte budget shared by every transfer of a run.
pub struct SharedRateLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    burst: NonZeroU32,
}

impl SharedRateLimiter {
    pub fn per_second(bytes: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::direct(Quota::per_second(bytes)),
            burst: bytes,
        }
    }

    /// Waits until `bytes` may pass. Requests larger than one second's worth
    /// are split so they never exceed the bucket.
    pub async fn acquire(&self, mut bytes: usize) {
        while bytes > 0 {
            let step = bytes.min(self.burst.get() as usize);
            if let Some(n) = NonZeroU32::new(step as u32) {
                let _ = self.limiter.until_n_ready(n).await;
            }
            bytes -= step;
        }
    }
}

/// Streams the unrestricted link to disk.
///
/// Bytes land in `<destination>.part`, which is resumed with a Range request
/// when present and renamed into place once complete (and verified, when a
/// hash is known).
pub struct HttpDownloader {
    client: Client,
    url: String,
    destination: PathBuf,
    expected_sha256: Option<String>,
    rate_limiter: Option<Arc<SharedRateLimiter>>,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
}

impl HttpDownloader {
    pub fn new(client: Client, url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            client,
            url: url.into(),
            destination: destination.into(),
            expected_sha256: None,
            rate_limiter: None,
            cancel: CancellationToken::new(),
            paused,
        }
    }

    pub fn with_expected_sha256(mut self, hash: Option<String>) -> Self {
        self.expected_sha256 = hash;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<SharedRateLimiter>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn build_client(config: &TransferConfig) -> reqwest::Result<Client> {
        Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout)
            .build()
    }

    async fn wait_while_paused(
        &self,
        paused: &mut watch::Receiver<bool>,
    ) -> Result<(), DownloadError> {
        loop {
            let is_paused = *paused.borrow_and_update();
            if !is_paused {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn transfer(&self, events: &EventSender) -> Result<PathBuf, DownloadError> {
        if let Some(parent) = self.destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let part = naming::part_path(&self.destination);
        let mut offset = fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);

        let mut request = self.client.get(&self.url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = request.send() => response?,
        };
        let response = response.error_for_status()?;

        if offset > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            warn!("Server ignored range request for {}, restarting from zero", self.url);
            offset = 0;
        }

        let total = response.content_length().map(|len| len + offset).unwrap_or(0);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(offset > 0)
            .truncate(offset == 0)
            .open(&part)
            .await?;

        let started = Instant::now();
        let mut last_report = started;
        let mut done = offset;
        let speed = |done: u64| {
            let secs = started.elapsed().as_secs_f64();
            if secs > 0.0 {
                ((done - offset) as f64 / secs) as u64
            } else {
                0
            }
        };

        events.progress(done, total, 0);

        let mut paused = self.paused.subscribe();
        let mut stream = response.bytes_stream();

        loop {
            self.wait_while_paused(&mut paused).await?;

            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = stream.next() => match next {
                    Some(chunk) => chunk?,
                    None => break,
                },
            };

            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire(chunk.len()).await;
            }

            file.write_all(&chunk).await?;
            done += chunk.len() as u64;

            if last_report.elapsed() >= PROGRESS_INTERVAL {
                events.progress(done, total.max(done), speed(done));
                last_report = Instant::now();
            }
        }

        file.flush().await?;
        drop(file);
        events.progress(done, total.max(done), speed(done));

        if let Some(expected) = &self.expected_sha256 {
            let actual = hashing::sha256_file(&part).await?;
            if !expected.eq_ignore_ascii_case(&actual) {
                let _ = fs::remove_file(&part).await;
                return Err(DownloadError::HashMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
            debug!("Verified {} (SHA256: {})", self.destination.display(), actual);
        }

        fs::rename(&part, &self.destination).await?;
        info!("Downloaded {} to {}", self.url, self.destination.display());
        Ok(self.destination.clone())
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn start(&self, events: EventSender) -> Result<PathBuf, DownloadError> {
        debug!(
            "Starting download of {}, writing to path: {}",
            self.url,
            self.destination.display()
        );
        let outcome = self.transfer(&events).await;
        events.finish(outcome)
    }

    async fn pause(&self) {
        self.paused.send_replace(true);
    }

    async fn resume(&self) {
        self.paused.send_replace(false);
    }

    async fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DownloadEvent;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves `body` with a 200 to every connection, ignoring Range headers.
    async fn serve(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}/files/movie.mkv", addr)
    }

    fn client() -> Client {
        HttpDownloader::build_client(&TransferConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn downloads_and_verifies_hash() {
        let url = serve(b"abc").await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("t/movie.mkv");
        let downloader = HttpDownloader::new(client(), url, &destination).with_expected_sha256(Some(
            "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD".into(),
        ));

        let (tx, mut rx) = EventSender::channel();
        let path = downloader.start(tx).await.unwrap();

        assert_eq!(path, destination);
        assert_eq!(std::fs::read(&destination).unwrap(), b"abc");
        assert!(!naming::part_path(&destination).exists());

        let mut last_done = 0;
        let mut terminal = None;
        while let Some(event) = rx.recv().await {
            match event {
                DownloadEvent::Progress(p) => {
                    assert!(p.bytes_done >= last_done);
                    last_done = p.bytes_done;
                }
                other => terminal = Some(other),
            }
        }
        assert_eq!(last_done, 3);
        assert_eq!(terminal, Some(DownloadEvent::Completed { path: destination }));
    }

    #[tokio::test]
    async fn hash_mismatch_discards_partial_file() {
        let url = serve(b"abc").await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("movie.mkv");
        let downloader = HttpDownloader::new(client(), url, &destination)
            .with_expected_sha256(Some("00".into()));

        let err = downloader.start(EventSender::detached()).await.unwrap_err();

        assert!(matches!(err, DownloadError::HashMismatch { .. }));
        assert!(!destination.exists());
        assert!(!naming::part_path(&destination).exists());
    }

    #[tokio::test]
    async fn restarts_when_range_is_ignored() {
        let url = serve(b"hello world").await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("movie.mkv");
        std::fs::write(naming::part_path(&destination), b"stale").unwrap();

        let downloader = HttpDownloader::new(client(), url, &destination);
        downloader.start(EventSender::detached()).await.unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn cancel_while_paused_ends_the_transfer() {
        let url = serve(b"abc").await;
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(HttpDownloader::new(client(), url, dir.path().join("m.mkv")));
        downloader.pause().await;

        let running = downloader.clone();
        let task = tokio::spawn(async move { running.start(EventSender::detached()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        downloader.cancel().await;

        assert_eq!(task.await.unwrap(), Err(DownloadError::Cancelled));
    }

    #[tokio::test]
    async fn paused_transfer_completes_after_resume() {
        let url = serve(b"hello world").await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("m.mkv");
        let downloader = Arc::new(HttpDownloader::new(client(), url, &destination));
        downloader.pause().await;

        let running = downloader.clone();
        let task = tokio::spawn(async move { running.start(EventSender::detached()).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!task.is_finished());
        assert!(!destination.exists());

        downloader.resume().await;
        let path = task.await.unwrap().unwrap();

        assert_eq!(path, destination);
        assert_eq!(std::fs::read(&destination).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn rate_limiter_splits_large_requests() {
        let limiter = SharedRateLimiter::per_second(NonZeroU32::new(1024).unwrap());
        // Within the initial burst, so this returns without waiting.
        limiter.acquire(1024).await;
        limiter.acquire(0).await;
    }
}
