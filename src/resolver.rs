//! Locating upstream content inside the remote mount.
//!
//! The mount does not always expose an item at the depth its logical path
//! suggests, and freshly added content can take a while to sync. The resolver
//! therefore probes every ancestor of the expected directory plus two
//! name-based fallbacks, and repeats the scan with a linearly growing delay.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::ResolverConfig;
use crate::error::DownloadError;
use crate::naming::LogicalPath;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Read-only view of the filesystem the resolver searches.
#[async_trait]
pub trait DirectoryProbe: Send + Sync {
    async fn is_dir(&self, path: &Path) -> bool;

    /// Names of the entries directly under `path`.
    async fn list(&self, path: &Path) -> io::Result<Vec<String>>;
}

/// Probes the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountProbe;

#[async_trait]
impl DirectoryProbe for MountProbe {
    async fn is_dir(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }

    async fn list(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

pub struct PathResolver<P = MountProbe> {
    config: ResolverConfig,
    probe: P,
}

impl PathResolver<MountProbe> {
    pub fn new(config: ResolverConfig) -> Self {
        Self::with_probe(config, MountProbe)
    }
}

impl<P: DirectoryProbe> PathResolver<P> {
    pub fn with_probe(config: ResolverConfig, probe: P) -> Self {
        Self { config, probe }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Directories whose child named after the item is probed, in search
    /// order: the expected parent and each of its ancestors up to and
    /// including the mount root, then `root/<file name>` and
    /// `root/<file name without extension>`.
    ///
    /// Only plain name segments of the parent path are kept, so `..`, `.`
    /// and absolute prefixes cannot lead the search out of the mount.
    pub fn candidates(&self, logical: &LogicalPath) -> Vec<PathBuf> {
        let root = self.config.mount_root.as_path();
        let mut search = root.to_path_buf();
        for component in Path::new(&logical.parent_path).components() {
            if let Component::Normal(name) = component {
                search.push(name);
            }
        }

        let mut candidates = Vec::new();
        let mut dir = search.as_path();
        loop {
            candidates.push(dir.to_path_buf());
            if dir == root {
                break;
            }
            match dir.parent() {
                Some(parent) if parent.starts_with(root) => dir = parent,
                _ => break,
            }
        }

        candidates.push(root.join(&logical.file_name));
        candidates.push(root.join(&logical.file_name_without_extension));
        candidates
    }

    /// Finds the directory backing `logical_path`.
    ///
    /// `on_attempt` is called with the zero-based attempt index before each
    /// scan.
    ///
    /// # Errors
    ///
    /// - `DownloadError::UnsupportedContentKind` - the extension is disallowed; nothing is probed
    /// - `DownloadError::ResolutionNotFound` - no candidate matched within the retry budget
    /// - `DownloadError::Cancelled` - `cancel` fired before a probe or during a backoff
    pub async fn resolve<F>(
        &self,
        logical_path: &str,
        cancel: &CancellationToken,
        mut on_attempt: F,
    ) -> Result<PathBuf, DownloadError>
    where
        F: FnMut(u32) + Send,
    {
        let logical = LogicalPath::parse(logical_path);

        if self.config.is_disallowed(logical.extension()) {
            return Err(DownloadError::UnsupportedContentKind {
                extension: logical.extension().to_string(),
            });
        }

        let mount_root = &self.config.mount_root;
        let target_name = logical.file_name_without_extension.as_str();

        if matches!(target_name, "" | "." | "..") {
            return Err(self.not_found(&logical, 0));
        }

        let candidates = self.candidates(&logical);

        for attempt in 0..self.config.max_retries {
            on_attempt(attempt);
            debug!(
                "Searching {} for {} (attempt #{})...",
                mount_root.display(),
                logical.file_name,
                attempt
            );

            for candidate in &candidates {
                if cancel.is_cancelled() {
                    return Err(DownloadError::Cancelled);
                }

                let path = candidate.join(target_name);
                debug!("Searching {}...", path.display());

                if self.probe.is_dir(&path).await {
                    debug!("Found {} on attempt #{}", path.display(), attempt);
                    return Ok(path);
                }
            }

            let delay = self
                .config
                .backoff_step
                .checked_mul(attempt)
                .unwrap_or(MAX_BACKOFF)
                .min(MAX_BACKOFF);
            tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.log_mount_contents().await;
        Err(self.not_found(&logical, self.config.max_retries))
    }

    async fn log_mount_contents(&self) {
        let root = &self.config.mount_root;
        match self.probe.list(root).await {
            Ok(names) => debug!(
                "Unable to find file in mount. Entries available in {}: {}",
                root.display(),
                names.join(", ")
            ),
            Err(e) => error!("Unable to list mount root {}: {}", root.display(), e),
        }
    }

    fn not_found(&self, logical: &LogicalPath, attempts: u32) -> DownloadError {
        DownloadError::ResolutionNotFound {
            name: logical.file_name.clone(),
            mount_root: self.config.mount_root.clone(),
            attempts,
        }
    }
}
