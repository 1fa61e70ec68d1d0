//! Tracing setup: console output at the requested level, plus an optional
//! log file that always records debug detail.

use std::fs::{self, File};
use std::path::Path;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Installs the global subscriber. `RUST_LOG` overrides `console_level`.
///
/// # Errors
///
/// - `std::io::Error` - the log file or its directory cannot be created
pub fn init_tracing(console_level: Level, log_file: Option<&Path>) -> std::io::Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let file = File::create(path)?;
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .with_writer(file)
                    .with_filter(EnvFilter::new("rdlink=debug")),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    match log_file {
        Some(path) => tracing::debug!(
            "Tracing initialized: console={}, log_file={}",
            console_level,
            path.display()
        ),
        None => tracing::debug!("Tracing initialized: console={}", console_level),
    }
    Ok(())
}
