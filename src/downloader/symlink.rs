use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Downloader;
use crate::error::{DownloadError, LinkError};
use crate::events::EventSender;
use crate::linker;
use crate::resolver::{DirectoryProbe, MountProbe, PathResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymlinkState {
    NotStarted,
    Searching,
    Found,
    Linking,
    Linked,
    LinkFailed,
    RetriesExhausted,
    Complete,
    Failed,
}

impl SymlinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for SymlinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Resolves a download inside the remote mount and links to it instead of
/// transferring bytes.
///
/// The link is created at the parent directory of `destination`, so the
/// download's folder under the torrent becomes a link to the matched
/// directory.
pub struct SymlinkDownloader<P = MountProbe> {
    uri: String,
    destination: PathBuf,
    path: String,
    resolver: Arc<PathResolver<P>>,
    cancel: CancellationToken,
    state: Mutex<SymlinkState>,
}

impl<P: DirectoryProbe> SymlinkDownloader<P> {
    pub fn new(
        uri: impl Into<String>,
        destination: impl Into<PathBuf>,
        path: impl Into<String>,
        resolver: Arc<PathResolver<P>>,
    ) -> Self {
        Self {
            uri: uri.into(),
            destination: destination.into(),
            path: path.into(),
            resolver,
            cancel: CancellationToken::new(),
            state: Mutex::new(SymlinkState::NotStarted),
        }
    }

    pub fn state(&self) -> SymlinkState {
        *self.state.lock()
    }

    fn enter(&self, next: SymlinkState) {
        let mut state = self.state.lock();
        debug!("{}: {} -> {}", self.path, *state, next);
        *state = next;
    }

    fn link_path(&self) -> Result<&Path, LinkError> {
        self.destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| LinkError {
                source_path: PathBuf::new(),
                link_path: self.destination.clone(),
                reason: "destination has no parent directory".to_string(),
            })
    }

    async fn run(&self, events: &EventSender) -> Result<PathBuf, DownloadError> {
        events.progress(0, 0, 0);
        self.enter(SymlinkState::Searching);

        let attempts_total = u64::from(self.resolver.config().max_retries);
        let resolved = self
            .resolver
            .resolve(&self.path, &self.cancel, |attempt| {
                events.progress(u64::from(attempt), attempts_total, 1)
            })
            .await;

        let source = match resolved {
            Ok(source) => source,
            Err(e) => {
                if matches!(e, DownloadError::ResolutionNotFound { .. }) {
                    self.enter(SymlinkState::RetriesExhausted);
                }
                return Err(e);
            }
        };

        self.enter(SymlinkState::Found);
        debug!("Found {} for {}", source.display(), self.path);

        self.enter(SymlinkState::Linking);
        let linked = match self.link_path() {
            Ok(link_path) => linker::materialize(&source, link_path).await,
            Err(e) => Err(LinkError {
                source_path: source.clone(),
                ..e
            }),
        };

        match linked {
            Ok(()) => {
                self.enter(SymlinkState::Linked);
                Ok(source)
            }
            Err(e) => {
                self.enter(SymlinkState::LinkFailed);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl<P: DirectoryProbe> Downloader for SymlinkDownloader<P> {
    async fn start(&self, events: EventSender) -> Result<PathBuf, DownloadError> {
        debug!(
            "Starting symlink resolving of {}, writing to path: {}",
            self.uri,
            self.destination.display()
        );

        let outcome = self.run(&events).await;
        self.enter(if outcome.is_ok() {
            SymlinkState::Complete
        } else {
            SymlinkState::Failed
        });
        events.finish(outcome)
    }

    async fn pause(&self) {}

    async fn resume(&self) {}

    async fn cancel(&self) {
        self.cancel.cancel();
    }
}
