use color_eyre::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing: a daily rolling log file in `log_dir`, plus stderr
/// when `verbose` is set. `RUST_LOG` overrides the default filter.
///
/// Keep the returned guard alive for the life of the process so buffered
/// lines are flushed.
pub fn init(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)?;

  let file_appender = tracing_appender::rolling::daily(log_dir, "cityseva-sw.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new("cityseva_sw=info,warn"));

  let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(stderr_layer)
    .try_init()?;

  Ok(guard)
}
