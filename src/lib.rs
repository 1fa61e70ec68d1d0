//! Materializes debrid downloads as local files, either by streaming bytes
//! or by linking to content already visible through a remote mount.

pub mod config;
pub mod downloader;
pub mod error;
pub mod events;
pub mod hashing;
pub mod lifecycle;
pub mod linker;
pub mod logging;
pub mod naming;
pub mod resolver;

pub use config::{Config, ResolverConfig, RetryPolicy, TransferConfig};
pub use downloader::{Downloader, HttpDownloader, SymlinkDownloader};
pub use error::{DownloadError, ErrorKind, LifecycleError, LinkError};
pub use events::{DownloadEvent, DownloadProgress, EventReceiver, EventSender};
pub use lifecycle::{Download, DownloadStatus, DownloadStore, StoreEvent};
pub use resolver::{DirectoryProbe, MountProbe, PathResolver};
