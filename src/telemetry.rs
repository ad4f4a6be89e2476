use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::Config;

const LOG_FILE: &str = "fibrefield-proxy.log";

/// Install the global subscriber: stderr always, plus a daily-rolling file in
/// the data dir when enabled. Keep the returned guard alive until exit so
/// buffered file output is flushed.
pub fn init(config: &Config) -> Result<Option<WorkerGuard>> {
  let env_filter = EnvFilter::builder()
    .parse_lossy(std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()));

  let stderr_layer = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(true)
    .boxed();

  let (file_layer, guard) = if config.logging.file {
    let dir = config.data_dir()?.join("logs");
    std::fs::create_dir_all(&dir)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
      .with_writer(writer)
      .with_ansi(false)
      .with_target(true)
      .boxed();
    (Some(layer), Some(guard))
  } else {
    (None, None)
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
