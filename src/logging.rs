use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log filter directives, e.g. `fieldsync=debug`
pub const LOG_ENV: &str = "FIELDSYNC_LOG";

const LOG_FILE_PREFIX: &str = "fieldsync.log";

/// $XDG_DATA_HOME/fieldsync/logs
pub fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("fieldsync").join("logs"))
}

/// Install the global subscriber, writing to a daily rolling file in
/// `dir`. Keep the returned guard alive until exit or buffered lines are lost.
pub fn init(dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_logs_land_in_rolling_file() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("logs");
    let guard = init(&logs).unwrap();
    tracing::info!(target: "fieldsync", "hello from the log test");
    drop(guard);

    let files: Vec<_> = std::fs::read_dir(&logs)
      .unwrap()
      .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
      .collect();
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with(LOG_FILE_PREFIX));
    let contents = std::fs::read_to_string(logs.join(&files[0])).unwrap();
    assert!(contents.contains("hello from the log test"));
  }
}
