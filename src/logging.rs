//! Tracing setup for the host application.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("offsync=info"))
}

/// Log to stderr, filtered by RUST_LOG (default `offsync=info`).
pub fn init() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(env_filter())
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))
}

/// Log to a daily-rolled file under `<data_dir>/logs`. The returned
/// guard must be kept alive for the writer thread to keep flushing.
pub fn init_with_file(data_dir: &Path) -> Result<WorkerGuard> {
  let appender = tracing_appender::rolling::daily(data_dir.join("logs"), "offsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter())
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
