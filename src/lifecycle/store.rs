use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Download, Phase};
use crate::error::LifecycleError;

/// Published after every committed mutation so aggregate views of the
/// owning torrent can be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    CacheInvalidated { torrent_id: Uuid },
}

type Records = HashMap<Uuid, Download>;

/// Download records, optionally mirrored to a JSON snapshot on disk.
///
/// Setters that reference an unknown download id are silent no-ops; only
/// `reset` reports `NotFound`. Each mutation is applied to a copy and
/// swapped in after the snapshot is written, so a failed write leaves the
/// store unchanged.
pub struct DownloadStore {
    records: Mutex<Records>,
    snapshot: Option<PathBuf>,
    events: broadcast::Sender<StoreEvent>,
}

impl DownloadStore {
    pub fn in_memory() -> Self {
        Self::with_records(Records::new(), None)
    }

    /// Opens the snapshot at `path`, starting empty if it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LifecycleError> {
        let path = path.into();
        let records = match fs::read_to_string(&path).await {
            Ok(content) => {
                let downloads: Vec<Download> = serde_json::from_str(&content)?;
                downloads.into_iter().map(|d| (d.download_id, d)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Records::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} downloads from {}", records.len(), path.display());
        Ok(Self::with_records(records, Some(path)))
    }

    fn with_records(records: Records, snapshot: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            records: Mutex::new(records),
            snapshot,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub async fn create(&self, torrent_id: Uuid, path: &str) -> Result<Download, LifecycleError> {
        let download = Download::new(torrent_id, path, Utc::now());
        let created = download.clone();
        self.mutate(move |records| {
            records.insert(download.download_id, download);
            Ok(vec![torrent_id])
        })
        .await?;
        Ok(created)
    }

    pub async fn get_for_torrent(&self, torrent_id: Uuid) -> Vec<Download> {
        let records = self.records.lock().await;
        let mut downloads: Vec<Download> = records
            .values()
            .filter(|d| d.torrent_id == torrent_id)
            .cloned()
            .collect();
        downloads.sort_by(|a, b| a.added.cmp(&b.added).then_with(|| a.path.cmp(&b.path)));
        downloads
    }

    pub async fn get_by_id(&self, download_id: Uuid) -> Option<Download> {
        self.records.lock().await.get(&download_id).cloned()
    }

    pub async fn get(&self, torrent_id: Uuid, path: &str) -> Option<Download> {
        self.records
            .lock()
            .await
            .values()
            .find(|d| d.torrent_id == torrent_id && d.path == path)
            .cloned()
    }

    pub async fn all(&self) -> Vec<Download> {
        let records = self.records.lock().await;
        let mut downloads: Vec<Download> = records.values().cloned().collect();
        downloads.sort_by(|a, b| a.added.cmp(&b.added).then_with(|| a.path.cmp(&b.path)));
        downloads
    }

    pub async fn update_link(&self, download_id: Uuid, link: &str) -> Result<(), LifecycleError> {
        let link = link.to_string();
        self.update(download_id, move |d| {
            d.link = Some(link);
            Ok(())
        })
        .await
    }

    pub async fn update_download_started(
        &self,
        download_id: Uuid,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), LifecycleError> {
        self.update_phase(download_id, Phase::DownloadStarted, at).await
    }

    pub async fn update_download_finished(
        &self,
        download_id: Uuid,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), LifecycleError> {
        self.update_phase(download_id, Phase::DownloadFinished, at).await
    }

    pub async fn update_unpacking_queued(
        &self,
        download_id: Uuid,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), LifecycleError> {
        self.update_phase(download_id, Phase::UnpackingQueued, at).await
    }

    pub async fn update_unpacking_started(
        &self,
        download_id: Uuid,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), LifecycleError> {
        self.update_phase(download_id, Phase::UnpackingStarted, at).await
    }

    pub async fn update_unpacking_finished(
        &self,
        download_id: Uuid,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), LifecycleError> {
        self.update_phase(download_id, Phase::UnpackingFinished, at).await
    }

    pub async fn update_completed(
        &self,
        download_id: Uuid,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), LifecycleError> {
        self.update_phase(download_id, Phase::Completed, at).await
    }

    pub async fn update_error(
        &self,
        download_id: Uuid,
        error: Option<String>,
    ) -> Result<(), LifecycleError> {
        self.update(download_id, move |d| {
            d.error = error;
            Ok(())
        })
        .await
    }

    pub async fn update_retry_count(
        &self,
        download_id: Uuid,
        retry_count: u32,
    ) -> Result<(), LifecycleError> {
        self.update(download_id, move |d| {
            d.retry_count = retry_count;
            Ok(())
        })
        .await
    }

    pub async fn update_remote_id(
        &self,
        download_id: Uuid,
        remote_id: &str,
    ) -> Result<(), LifecycleError> {
        let range = HashMap::from([(download_id, remote_id.to_string())]);
        self.update_remote_id_range(&range).await
    }

    /// Sets the error of every known id in one commit; unknown ids are skipped.
    pub async fn update_error_in_range(
        &self,
        errors: &HashMap<Uuid, String>,
    ) -> Result<(), LifecycleError> {
        self.update_range(errors, |d, error| d.error = Some(error.to_string()))
            .await
    }

    /// Sets the remote id of every known id in one commit; unknown ids are skipped.
    pub async fn update_remote_id_range(
        &self,
        remote_ids: &HashMap<Uuid, String>,
    ) -> Result<(), LifecycleError> {
        self.update_range(remote_ids, |d, remote_id| {
            d.remote_id = Some(remote_id.to_string())
        })
        .await
    }

    /// Returns the download to its initial queued state.
    ///
    /// # Errors
    ///
    /// - `LifecycleError::NotFound` - no download has this id
    pub async fn reset(&self, download_id: Uuid) -> Result<(), LifecycleError> {
        self.mutate(|records| {
            let download = records
                .get_mut(&download_id)
                .ok_or(LifecycleError::NotFound(download_id))?;
            download.reset(Utc::now());
            Ok(vec![download.torrent_id])
        })
        .await
    }

    pub async fn delete_for_torrent(&self, torrent_id: Uuid) -> Result<(), LifecycleError> {
        self.mutate(|records| {
            records.retain(|_, d| d.torrent_id != torrent_id);
            Ok(vec![torrent_id])
        })
        .await
    }

    async fn update_phase(
        &self,
        download_id: Uuid,
        phase: Phase,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), LifecycleError> {
        self.update(download_id, move |d| d.set_phase(phase, at)).await
    }

    async fn update<F>(&self, download_id: Uuid, apply: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(&mut Download) -> Result<(), LifecycleError>,
    {
        self.mutate(|records| match records.get_mut(&download_id) {
            Some(download) => {
                apply(download)?;
                Ok(vec![download.torrent_id])
            }
            None => {
                debug!("Ignoring update of unknown download {}", download_id);
                Ok(Vec::new())
            }
        })
        .await
    }

    async fn update_range<F>(
        &self,
        values: &HashMap<Uuid, String>,
        apply: F,
    ) -> Result<(), LifecycleError>
    where
        F: Fn(&mut Download, &str),
    {
        self.mutate(|records| {
            let mut touched = Vec::new();
            for (id, value) in values {
                if let Some(download) = records.get_mut(id) {
                    apply(download, value);
                    touched.push(download.torrent_id);
                }
            }
            Ok(touched)
        })
        .await
    }

    /// Applies `change` to a copy of the records and commits it.
    ///
    /// `change` returns the torrents it touched; an empty list means nothing
    /// changed and nothing is written.
    async fn mutate<F>(&self, change: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(&mut Records) -> Result<Vec<Uuid>, LifecycleError>,
    {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        let touched: BTreeSet<Uuid> = change(&mut next)?.into_iter().collect();
        if touched.is_empty() {
            return Ok(());
        }

        if let Some(path) = &self.snapshot {
            write_snapshot(path, &next).await?;
        }
        *records = next;
        drop(records);

        for torrent_id in touched {
            let _ = self.events.send(StoreEvent::CacheInvalidated { torrent_id });
        }
        Ok(())
    }
}

async fn write_snapshot(path: &Path, records: &Records) -> Result<(), LifecycleError> {
    let mut downloads: Vec<&Download> = records.values().collect();
    downloads.sort_by_key(|d| (d.torrent_id, d.added, d.download_id));
    let content = serde_json::to_string_pretty(&downloads)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        warn!("Failed to replace {}: {}", path.display(), e);
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::DownloadStatus;
    use chrono::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    #[tokio::test]
    async fn create_sets_queued_timestamps() {
        let store = DownloadStore::in_memory();
        let torrent = Uuid::new_v4();
        let before = Utc::now();

        let d = store.create(torrent, "a/b.mkv").await.unwrap();

        assert!(d.added.unwrap() >= before);
        assert_eq!(d.added, d.download_queued);
        assert_eq!(d.retry_count, 0);
        assert_eq!(store.get(torrent, "a/b.mkv").await, Some(d.clone()));
        assert_eq!(store.get_by_id(d.download_id).await, Some(d));
    }

    #[tokio::test]
    async fn every_mutation_invalidates_the_torrent() {
        let store = DownloadStore::in_memory();
        let mut events = store.subscribe();
        let torrent = Uuid::new_v4();

        let d = store.create(torrent, "x.mkv").await.unwrap();
        store.update_link(d.download_id, "https://cdn/x.mkv").await.unwrap();
        store.update_download_started(d.download_id, Some(Utc::now())).await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                events.try_recv().unwrap(),
                StoreEvent::CacheInvalidated { torrent_id: torrent }
            );
        }
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn updates_to_unknown_ids_are_silent() {
        let store = DownloadStore::in_memory();
        let mut events = store.subscribe();
        let unknown = Uuid::new_v4();

        store.update_error(unknown, Some("boom".into())).await.unwrap();
        store.update_retry_count(unknown, 4).await.unwrap();
        store.update_completed(unknown, Some(Utc::now())).await.unwrap();
        store.update_remote_id(unknown, "R").await.unwrap();

        assert!(store.all().await.is_empty());
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn reset_restores_queued_state() {
        let store = DownloadStore::in_memory();
        let d = store.create(Uuid::new_v4(), "x.mkv").await.unwrap();
        let id = d.download_id;
        let now = Utc::now();
        store.update_link(id, "https://cdn/x.mkv").await.unwrap();
        store.update_download_started(id, Some(now)).await.unwrap();
        store.update_download_finished(id, Some(now)).await.unwrap();
        store.update_unpacking_queued(id, Some(now)).await.unwrap();
        store.update_unpacking_started(id, Some(now)).await.unwrap();
        store.update_unpacking_finished(id, Some(now)).await.unwrap();
        store.update_retry_count(id, 2).await.unwrap();
        store.update_error(id, Some("boom".into())).await.unwrap();

        let before_reset = Utc::now();
        store.reset(id).await.unwrap();

        let d = store.get_by_id(id).await.unwrap();
        assert!(d.added.unwrap() >= before_reset);
        assert_eq!(d.added, d.download_queued);
        assert_eq!(d.link, None);
        assert_eq!(d.download_started, None);
        assert_eq!(d.download_finished, None);
        assert_eq!(d.unpacking_queued, None);
        assert_eq!(d.unpacking_started, None);
        assert_eq!(d.unpacking_finished, None);
        assert_eq!(d.completed, None);
        assert_eq!(d.retry_count, 0);
        assert_eq!(d.error, None);
        assert_eq!(d.status(), DownloadStatus::Queued);
    }

    #[tokio::test]
    async fn reset_of_unknown_id_fails() {
        let store = DownloadStore::in_memory();
        let unknown = Uuid::new_v4();

        let err = store.reset(unknown).await.unwrap_err();

        assert!(matches!(err, LifecycleError::NotFound(id) if id == unknown));
    }

    #[tokio::test]
    async fn out_of_order_update_leaves_record_untouched() {
        let store = DownloadStore::in_memory();
        let d = store.create(Uuid::new_v4(), "x.mkv").await.unwrap();
        let early = d.added.unwrap() - Duration::hours(1);

        let err = store
            .update_download_started(d.download_id, Some(early))
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::OutOfOrder { .. }));
        assert_eq!(store.get_by_id(d.download_id).await, Some(d));
    }

    #[tokio::test]
    async fn error_range_skips_unknown_and_commits_known() {
        let store = DownloadStore::in_memory();
        let torrent = Uuid::new_v4();
        let a = store.create(torrent, "a.mkv").await.unwrap();
        let b = store.create(torrent, "b.mkv").await.unwrap();
        let mut events = store.subscribe();

        let errors = HashMap::from([
            (a.download_id, "a failed".to_string()),
            (Uuid::new_v4(), "ghost".to_string()),
            (b.download_id, "b failed".to_string()),
        ]);
        store.update_error_in_range(&errors).await.unwrap();

        let error_of = |d: Option<Download>| d.and_then(|d| d.error);
        assert_eq!(error_of(store.get_by_id(a.download_id).await).as_deref(), Some("a failed"));
        assert_eq!(error_of(store.get_by_id(b.download_id).await).as_deref(), Some("b failed"));
        // One commit, one invalidation for the shared torrent.
        assert_eq!(
            events.try_recv().unwrap(),
            StoreEvent::CacheInvalidated { torrent_id: torrent }
        );
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn remote_id_range_updates_known_ids() {
        let store = DownloadStore::in_memory();
        let a = store.create(Uuid::new_v4(), "a.mkv").await.unwrap();

        let ids = HashMap::from([
            (a.download_id, "RD123".to_string()),
            (Uuid::new_v4(), "RD999".to_string()),
        ]);
        store.update_remote_id_range(&ids).await.unwrap();

        let stored = store.get_by_id(a.download_id).await.unwrap();
        assert_eq!(stored.remote_id.as_deref(), Some("RD123"));
    }

    #[tokio::test]
    async fn delete_for_torrent_only_removes_its_downloads() {
        let store = DownloadStore::in_memory();
        let keep = Uuid::new_v4();
        let gone = Uuid::new_v4();
        store.create(keep, "a.mkv").await.unwrap();
        store.create(gone, "b.mkv").await.unwrap();
        store.create(gone, "c.mkv").await.unwrap();

        store.delete_for_torrent(gone).await.unwrap();

        assert!(store.get_for_torrent(gone).await.is_empty());
        assert_eq!(store.get_for_torrent(keep).await.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/downloads.json");
        let torrent = Uuid::new_v4();

        let store = DownloadStore::open(&path).await.unwrap();
        let d = store.create(torrent, "a.mkv").await.unwrap();
        store.update_retry_count(d.download_id, 1).await.unwrap();
        drop(store);

        let reopened = DownloadStore::open(&path).await.unwrap();
        let loaded = reopened.get_by_id(d.download_id).await.unwrap();
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.path, "a.mkv");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("downloads.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = DownloadStore::open(&path).await.err().unwrap();
        assert!(matches!(err, LifecycleError::Corrupt(_)));
    }
}
