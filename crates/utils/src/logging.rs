//! provides logging helpers

use std::path::Path;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::InitError;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::util::TryInitError;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Log path `{0}` has no file name")]
    InvalidLogPath(String),

    #[error("Failed to create rolling file appender: {0}")]
    Appender(#[from] InitError),

    #[error("Failed to install global subscriber: {0}")]
    Install(#[from] TryInitError),
}

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// Events always go to stderr. When `log_file` is given they are also written to a
/// daily-rolling file next to it; the returned guard must be held for the lifetime
/// of the process so buffered lines are flushed.
pub fn init(log_file: Option<&Path>) -> Result<Option<WorkerGuard>, LoggingError> {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let (file_layer, guard) = match log_file {
        Some(log_file) => {
            let (file_writer, guard) = tracing_appender::non_blocking(rolling_appender(log_file)?);
            let file_layer = layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(file_layer), Some(guard))
        }
        None => (None, None),
    };

    registry().with(fmt_layer).with(file_layer).try_init()?;
    Ok(guard)
}

fn rolling_appender(log_file: &Path) -> Result<RollingFileAppender, LoggingError> {
    let file = log_file
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| LoggingError::InvalidLogPath(log_file.display().to_string()))?;
    let dir = match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    Ok(RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file)
        .max_log_files(3)
        .build(dir)?)
}
