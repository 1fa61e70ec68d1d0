//! The ordered event stream a downloader reports through.

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::error::{DownloadError, ErrorKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Bytes per second.
    pub speed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Progress(DownloadProgress),
    Completed { path: PathBuf },
    Failed { kind: ErrorKind, message: String },
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<DownloadEvent>;

/// Sending half handed to `Downloader::start`.
///
/// A dropped receiver is not an error: nobody is listening, the download
/// still runs to completion.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sender whose events go nowhere.
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn progress(&self, bytes_done: u64, bytes_total: u64, speed: u64) {
        let _ = self.tx.send(DownloadEvent::Progress(DownloadProgress {
            bytes_done,
            bytes_total,
            speed,
        }));
    }

    /// Emits the terminal event for `outcome` and hands it back unchanged.
    pub fn finish(
        &self,
        outcome: Result<PathBuf, DownloadError>,
    ) -> Result<PathBuf, DownloadError> {
        let event = match &outcome {
            Ok(path) => DownloadEvent::Completed { path: path.clone() },
            Err(err) => DownloadEvent::Failed {
                kind: err.kind(),
                message: err.to_string(),
            },
        };
        let _ = self.tx.send(event);
        outcome
    }
}
