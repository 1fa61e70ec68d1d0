//! Strategies that turn a download record into a local artifact.

mod http;
mod symlink;

pub use http::{HttpDownloader, SharedRateLimiter};
pub use symlink::{SymlinkDownloader, SymlinkState};

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::DownloadError;
use crate::events::EventSender;

/// Capabilities shared by every download strategy.
///
/// One instance serves one `start()` call and is dropped afterwards.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Runs the download to completion.
    ///
    /// Progress goes to `events` in order, followed by exactly one terminal
    /// event that carries the same outcome as the return value.
    async fn start(&self, events: EventSender) -> Result<PathBuf, DownloadError>;

    async fn pause(&self);

    async fn resume(&self);

    /// Requests cancellation; an in-flight `start()` returns
    /// `DownloadError::Cancelled` at its next suspension point.
    async fn cancel(&self);
}
