use color_eyre::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn filter(verbose: bool) -> EnvFilter {
  let default = if verbose { "wellsync=debug" } else { "wellsync=info" };
  EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into())
}

/// Log to stderr. Used by one-shot commands.
pub fn init_stderr(verbose: bool) {
  tracing_subscriber::registry()
    .with(filter(verbose))
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .init();
}

/// Log to a daily rolling file in `dir`, keeping the console free for the
/// interactive session. Keep the guard alive until exit or buffered lines
/// are lost.
pub fn init_file(dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)?;
  let appender = tracing_appender::rolling::daily(dir, "wellsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter(verbose))
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();
  Ok(guard)
}
