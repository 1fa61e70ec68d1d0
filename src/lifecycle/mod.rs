//! Per-download lifecycle record.
//!
//! A `Download` moves through the download phase and the unpack phase, each
//! with queued/started/finished timestamps. Records are only changed through
//! `DownloadStore`, whose setters keep the phase timestamps in order.

mod store;

pub use store::{DownloadStore, StoreEvent};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LifecycleError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub download_id: Uuid,
    pub torrent_id: Uuid,
    pub path: String,
    pub link: Option<String>,
    pub remote_id: Option<String>,
    pub added: Option<DateTime<Utc>>,
    pub download_queued: Option<DateTime<Utc>>,
    pub download_started: Option<DateTime<Utc>>,
    pub download_finished: Option<DateTime<Utc>>,
    pub unpacking_queued: Option<DateTime<Utc>>,
    pub unpacking_started: Option<DateTime<Utc>>,
    pub unpacking_finished: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// Timestamped phases, in the order they happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Added,
    DownloadQueued,
    DownloadStarted,
    DownloadFinished,
    UnpackingQueued,
    UnpackingStarted,
    UnpackingFinished,
    Completed,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Added,
        Phase::DownloadQueued,
        Phase::DownloadStarted,
        Phase::DownloadFinished,
        Phase::UnpackingQueued,
        Phase::UnpackingStarted,
        Phase::UnpackingFinished,
        Phase::Completed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Added => "added",
            Phase::DownloadQueued => "download queued",
            Phase::DownloadStarted => "download started",
            Phase::DownloadFinished => "download finished",
            Phase::UnpackingQueued => "unpacking queued",
            Phase::UnpackingStarted => "unpacking started",
            Phase::UnpackingFinished => "unpacking finished",
            Phase::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Downloaded,
    Unpacking,
    Completed,
    Errored,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "Queued",
            Self::Downloading => "Downloading",
            Self::Downloaded => "Downloaded",
            Self::Unpacking => "Unpacking",
            Self::Completed => "Completed",
            Self::Errored => "Error",
        };
        f.write_str(s)
    }
}

impl Download {
    /// A freshly queued download.
    pub fn new(torrent_id: Uuid, path: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            download_id: Uuid::new_v4(),
            torrent_id,
            path: path.into(),
            link: None,
            remote_id: None,
            added: Some(now),
            download_queued: Some(now),
            download_started: None,
            download_finished: None,
            unpacking_queued: None,
            unpacking_started: None,
            unpacking_finished: None,
            completed: None,
            retry_count: 0,
            error: None,
        }
    }

    pub fn timestamp(&self, phase: Phase) -> Option<DateTime<Utc>> {
        match phase {
            Phase::Added => self.added,
            Phase::DownloadQueued => self.download_queued,
            Phase::DownloadStarted => self.download_started,
            Phase::DownloadFinished => self.download_finished,
            Phase::UnpackingQueued => self.unpacking_queued,
            Phase::UnpackingStarted => self.unpacking_started,
            Phase::UnpackingFinished => self.unpacking_finished,
            Phase::Completed => self.completed,
        }
    }

    fn timestamp_mut(&mut self, phase: Phase) -> &mut Option<DateTime<Utc>> {
        match phase {
            Phase::Added => &mut self.added,
            Phase::DownloadQueued => &mut self.download_queued,
            Phase::DownloadStarted => &mut self.download_started,
            Phase::DownloadFinished => &mut self.download_finished,
            Phase::UnpackingQueued => &mut self.unpacking_queued,
            Phase::UnpackingStarted => &mut self.unpacking_started,
            Phase::UnpackingFinished => &mut self.unpacking_finished,
            Phase::Completed => &mut self.completed,
        }
    }

    /// Sets or clears the timestamp of `phase`.
    ///
    /// # Errors
    ///
    /// - `LifecycleError::OutOfOrder` - `at` is earlier than a set earlier
    ///   phase or later than a set later phase
    pub(crate) fn set_phase(
        &mut self,
        phase: Phase,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), LifecycleError> {
        if let Some(at) = at {
            for other in Phase::ALL {
                let Some(other_at) = self.timestamp(other) else {
                    continue;
                };
                if (other < phase && other_at > at) || (other > phase && other_at < at) {
                    let (phase, at, earlier, earlier_at) = if other < phase {
                        (phase, at, other, other_at)
                    } else {
                        (other, other_at, phase, at)
                    };
                    return Err(LifecycleError::OutOfOrder {
                        phase: phase.name(),
                        at,
                        earlier: earlier.name(),
                        earlier_at,
                    });
                }
            }
        }
        *self.timestamp_mut(phase) = at;
        Ok(())
    }

    /// Back to the state `new` produces, keeping identity and path.
    pub(crate) fn reset(&mut self, now: DateTime<Utc>) {
        *self = Self {
            download_id: self.download_id,
            torrent_id: self.torrent_id,
            path: std::mem::take(&mut self.path),
            remote_id: self.remote_id.take(),
            ..Self::new(self.torrent_id, String::new(), now)
        };
    }

    pub fn status(&self) -> DownloadStatus {
        if self.error.is_some() {
            DownloadStatus::Errored
        } else if self.completed.is_some() {
            DownloadStatus::Completed
        } else if self.unpacking_queued.is_some() {
            DownloadStatus::Unpacking
        } else if self.download_finished.is_some() {
            DownloadStatus::Downloaded
        } else if self.download_started.is_some() {
            DownloadStatus::Downloading
        } else {
            DownloadStatus::Queued
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn download() -> (Download, DateTime<Utc>) {
        let now = Utc::now();
        (Download::new(Uuid::new_v4(), "a/b.mkv", now), now)
    }

    #[test]
    fn new_download_is_queued() {
        let (d, now) = download();
        assert_eq!(d.added, Some(now));
        assert_eq!(d.download_queued, Some(now));
        assert_eq!(d.retry_count, 0);
        assert_eq!(d.status(), DownloadStatus::Queued);
    }

    #[test]
    fn phases_advance_in_order() {
        let (mut d, now) = download();
        d.set_phase(Phase::DownloadStarted, Some(now + Duration::seconds(1))).unwrap();
        assert_eq!(d.status(), DownloadStatus::Downloading);
        d.set_phase(Phase::DownloadFinished, Some(now + Duration::seconds(2))).unwrap();
        assert_eq!(d.status(), DownloadStatus::Downloaded);
        // Unpacking can be skipped.
        d.set_phase(Phase::Completed, Some(now + Duration::seconds(3))).unwrap();
        assert_eq!(d.status(), DownloadStatus::Completed);
    }

    #[test]
    fn later_phase_before_earlier_is_rejected() {
        let (mut d, now) = download();
        d.set_phase(Phase::DownloadStarted, Some(now + Duration::seconds(10))).unwrap();

        let err = d
            .set_phase(Phase::DownloadFinished, Some(now + Duration::seconds(5)))
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::OutOfOrder {
                phase: "download finished",
                earlier: "download started",
                ..
            }
        ));
        assert_eq!(d.download_finished, None);

        // Moving an earlier phase past a later one is rejected too.
        let err = d
            .set_phase(Phase::DownloadQueued, Some(now + Duration::seconds(20)))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::OutOfOrder { phase: "download started", .. }));
    }

    #[test]
    fn clearing_a_phase_is_always_allowed() {
        let (mut d, now) = download();
        d.set_phase(Phase::DownloadStarted, Some(now)).unwrap();
        d.set_phase(Phase::DownloadStarted, None).unwrap();
        assert_eq!(d.download_started, None);
    }

    #[test]
    fn error_takes_precedence_in_status() {
        let (mut d, _) = download();
        d.error = Some("boom".into());
        assert_eq!(d.status(), DownloadStatus::Errored);
        assert_eq!(d.status().to_string(), "Error");
    }

    #[test]
    fn reset_clears_downstream_fields() {
        let (mut d, now) = download();
        let id = d.download_id;
        d.link = Some("https://x".into());
        d.remote_id = Some("R1".into());
        d.set_phase(Phase::DownloadStarted, Some(now)).unwrap();
        d.set_phase(Phase::Completed, Some(now)).unwrap();
        d.retry_count = 3;
        d.error = Some("boom".into());

        let later = now + Duration::minutes(1);
        d.reset(later);

        assert_eq!(d.download_id, id);
        assert_eq!(d.path, "a/b.mkv");
        assert_eq!(d.remote_id.as_deref(), Some("R1"));
        assert_eq!(d.link, None);
        assert_eq!(d.added, Some(later));
        assert_eq!(d.download_queued, Some(later));
        assert_eq!(d.download_started, None);
        assert_eq!(d.completed, None);
        assert_eq!(d.retry_count, 0);
        assert_eq!(d.error, None);
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let (d, _) = download();
        let json = serde_json::to_value(&d).unwrap();
        assert!(json.get("downloadQueued").is_some());
        assert!(json.get("retryCount").is_some());
        let back: Download = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }
}
