use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Why a single `start()` invocation of a downloader failed.
///
/// Values are cloneable so the terminal event and the returned error carry
/// the same thing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    #[error("cannot handle .{extension} archives with the symlink downloader")]
    UnsupportedContentKind { extension: String },

    #[error("could not find {name} in mount {mount_root} after {attempts} attempts")]
    ResolutionNotFound {
        name: String,
        mount_root: PathBuf,
        attempts: u32,
    },

    #[error("{0}")]
    LinkCreationFailed(#[from] LinkError),

    #[error("download cancelled")]
    Cancelled,

    #[error("download has no link to fetch")]
    MissingLink,

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedContentKind { .. } => ErrorKind::UnsupportedContentKind,
            Self::ResolutionNotFound { .. } => ErrorKind::ResolutionNotFound,
            Self::LinkCreationFailed(_) => ErrorKind::LinkCreationFailed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::MissingLink | Self::Transfer(_) | Self::HashMismatch { .. } => {
                ErrorKind::TransferFailed
            }
        }
    }

    /// Whether another orchestrator-level attempt could change the outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UnsupportedContentKind { .. } | Self::Cancelled | Self::MissingLink
        )
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        Self::Transfer(err.to_string())
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transfer(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    UnsupportedContentKind,
    ResolutionNotFound,
    LinkCreationFailed,
    Cancelled,
    TransferFailed,
}

/// Creating or verifying a symbolic link failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("error creating symbolic link from {source_path} to {link_path}: {reason}")]
pub struct LinkError {
    pub source_path: PathBuf,
    pub link_path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cannot find download with id {0}")]
    NotFound(Uuid),

    #[error("{phase} at {at} precedes {earlier} at {earlier_at}")]
    OutOfOrder {
        phase: &'static str,
        at: chrono::DateTime<chrono::Utc>,
        earlier: &'static str,
        earlier_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("failed to persist download store: {0}")]
    Persist(#[from] std::io::Error),

    #[error("download store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}
