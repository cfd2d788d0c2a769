//! Logging and tracing initialization.

use std::fs::File;
use std::path::Path;

use color_eyre::eyre::{Context, Result};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `verbose`. With a log file the events are written
/// there as JSON, otherwise compactly to stderr.
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("hauler={level}")))
        .wrap_err("Failed to create log filter")?;

    match log_file {
        Some(path) => init_file_logging(path, env_filter),
        None => {
            init_stderr_logging(env_filter);
            Ok(())
        }
    }
}

fn init_stderr_logging(env_filter: EnvFilter) {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn init_file_logging(path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(path)
        .wrap_err_with(|| format!("Failed to create log file {}", path.display()))?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
