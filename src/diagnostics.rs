//! Tracing setup for the host process.
//!
//! stdout carries the host protocol, so console output always goes to stderr.
//! When `[logging] file = true`, records are also written to a daily rolling
//! file under [`crate::pulse_dirs::logs_dir`] named `pixel-pulse.YYYY-MM-DD.log`.

use crate::config::LoggingConfig;
use crate::error::{PulseError, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Maximum number of daily log files to keep.
pub const MAX_LOG_FILES: usize = 7;

const LOG_FILE_PREFIX: &str = "pixel-pulse";

/// Build the filter from `RUST_LOG`, falling back to the configured level.
#[must_use]
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Open the rolling file appender in `log_dir`.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the appender fails
/// to initialise.
pub fn rolling_appender(log_dir: &Path) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(log_dir)?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir)
        .map_err(|e| PulseError::Config(format!("cannot open log file: {e}")))
}

/// Install the global tracing subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process. It is `None` when file logging is disabled.
///
/// # Errors
///
/// Returns an error if the log file cannot be opened or a global subscriber
/// is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = if config.file {
        let appender = rolling_appender(&crate::pulse_dirs::logs_dir())?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| PulseError::Config(format!("tracing already initialised: {e}")))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn rolling_appender_creates_log_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_dir = dir.path().join("nested").join("logs");
        let _appender = rolling_appender(&log_dir).expect("appender");
        assert!(log_dir.is_dir());
    }

    #[test]
    fn invalid_level_falls_back_to_info() {
        let config = LoggingConfig {
            level: "[[not a directive".to_owned(),
            file: false,
        };
        // Only checks that building the filter does not panic.
        let _filter = env_filter(&config);
    }
}
