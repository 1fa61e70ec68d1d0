//! Materializing a resolved directory as a symbolic link.

use std::io;
use std::path::Path;

use tracing::{error, info};

use crate::error::LinkError;

/// Creates `link_path` pointing at `source_path` and checks that it resolves
/// to a directory. Missing parents of `link_path` are created first.
///
/// Never retries; the caller decides whether a failure is fatal.
pub async fn materialize(source_path: &Path, link_path: &Path) -> Result<(), LinkError> {
    let fail = |reason: String| LinkError {
        source_path: source_path.to_path_buf(),
        link_path: link_path.to_path_buf(),
        reason,
    };

    if let Err(e) = create_link(source_path, link_path).await {
        error!(
            "Error creating symbolic link from {} to {}: {}",
            source_path.display(),
            link_path.display(),
            e
        );
        return Err(fail(e.to_string()));
    }

    let resolves_to_dir = tokio::fs::metadata(link_path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);

    if !resolves_to_dir {
        error!(
            "Failed to create symbolic link from {} to {}",
            source_path.display(),
            link_path.display()
        );
        return Err(fail("link does not resolve to a directory".to_string()));
    }

    info!(
        "Created symbolic link from {} to {}",
        source_path.display(),
        link_path.display()
    );
    Ok(())
}

async fn create_link(source_path: &Path, link_path: &Path) -> io::Result<()> {
    if let Some(parent) = link_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    #[cfg(unix)]
    {
        tokio::fs::symlink(source_path, link_path).await
    }

    #[cfg(windows)]
    {
        tokio::fs::symlink_dir(source_path, link_path).await
    }
}
