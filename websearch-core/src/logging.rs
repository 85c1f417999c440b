//! Logging infrastructure for websearch
//!
//! Logs go to a daily-rotated file in `$XDG_STATE_HOME/websearch/`. Nothing is
//! written to the terminal, which belongs to the progress display.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// HTTP and SQLite internals are only interesting when asked for via RUST_LOG
const QUIET_DEPENDENCIES: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "rustls=warn"];

/// Initialize file logging.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("websearch.log")
        .max_log_files(config.max_files.max(1))
        .build(&log_dir)
        .map_err(|e| Error::Config(format!("failed to create log file: {}", e)))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(build_filter(&config.level))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        log_dir,
        _guard: guard,
    })
}

fn build_filter(level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_DEPENDENCIES.iter().map(|d| d.to_string()));
    EnvFilter::try_new(directives.join(",")).unwrap_or_else(|e| {
        eprintln!("Invalid log level '{}' ({}), using info", level, e);
        EnvFilter::new("info")
    })
}

/// Route logs to the test harness output (idempotent)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Keeps the background log writer alive; flushes on drop
pub struct LoggingGuard {
    log_dir: PathBuf,
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

impl LoggingGuard {
    /// Directory the rotated log files are written to
    pub fn log_dir(&self) -> &PathBuf {
        &self.log_dir
    }
}

/// Path prefix of the rotated log files (each file gets a date suffix)
pub fn log_file_path() -> PathBuf {
    Config::log_path()
}
