use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Environment variable that replaces the default filter entirely
const FILTER_ENV: &str = "HUBSYNC_LOG";

/// Install the global subscriber.
///
/// Logs go to a daily rolling file so they never interleave with command
/// output; `verbose` sends them to stderr at debug level instead. The
/// returned guard flushes the writer when dropped.
pub fn init(config: &LogConfig, verbose: bool) -> Result<WorkerGuard> {
  let filter = match std::env::var(FILTER_ENV) {
    Ok(spec) => EnvFilter::new(spec),
    Err(_) if verbose => EnvFilter::new("hubsync=debug"),
    Err(_) => EnvFilter::new("hubsync=info"),
  };

  let (writer, guard) = if verbose {
    tracing_appender::non_blocking(std::io::stderr())
  } else {
    let dir = log_directory(config)?;
    std::fs::create_dir_all(&dir)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
    tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "hubsync.log"))
  };

  let subscriber = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(verbose)
    .with_ansi(verbose)
    .with_writer(writer)
    .finish();

  tracing::subscriber::set_global_default(subscriber)
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}

fn log_directory(config: &LogConfig) -> Result<PathBuf> {
  if let Some(dir) = &config.directory {
    return Ok(dir.clone());
  }
  let data_dir = dirs::data_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(data_dir.join("hubsync").join("logs"))
}
