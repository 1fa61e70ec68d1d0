//! Tunable settings for resolution, transfers and the retry policy.
//!
//! Everything the CLI can override lives here with its default, so the
//! library never reaches for process-wide state.

use std::path::PathBuf;
use std::time::Duration;

/// Attempts the resolver makes before giving up on a path.
pub const MAX_RETRIES: u32 = 10;

/// Backoff unit: attempt `n` is followed by a `n * BACKOFF_STEP` sleep.
pub const BACKOFF_STEP: Duration = Duration::from_millis(1000);

/// Archive containers the resolver refuses; it only serves extracted content.
pub const DISALLOWED_EXTENSIONS: &[&str] = &["zip", "rar", "tar"];

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub resolver: ResolverConfig,
    pub transfer: TransferConfig,
    pub retry: RetryPolicy,
}

/// Inputs of the path resolver.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Local path where the remote filesystem is mounted.
    pub mount_root: PathBuf,
    /// Extensions (without the dot, lowercase) that are rejected outright.
    pub disallowed_extensions: Vec<String>,
    pub max_retries: u32,
    pub backoff_step: Duration,
}

impl ResolverConfig {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
            ..Self::default()
        }
    }

    pub fn is_disallowed(&self, extension: &str) -> bool {
        let extension = extension.trim_start_matches('.');
        self.disallowed_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(extension))
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt/remote"),
            disallowed_extensions: DISALLOWED_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            max_retries: MAX_RETRIES,
            backoff_step: BACKOFF_STEP,
        }
    }
}

/// Settings for the byte-streaming downloader.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Global limit in bytes per second, shared by every transfer.
    pub rate_limit: Option<u32>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("rdlink/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(10),
            rate_limit: None,
        }
    }
}

/// How often the orchestrator re-queues a failed download.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_download_attempts: u32,
}

impl RetryPolicy {
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_download_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_download_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disallowed_extension_ignores_dot_and_case() {
        let config = ResolverConfig::default();
        assert!(config.is_disallowed("zip"));
        assert!(config.is_disallowed(".RAR"));
        assert!(!config.is_disallowed("mkv"));
        assert!(!config.is_disallowed(""));
    }

    #[test]
    fn retry_policy_stops_at_budget() {
        let policy = RetryPolicy { max_download_attempts: 2 };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }
}
