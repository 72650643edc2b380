//! Logging initialisation.
//!
//! Structured logs go to a non-blocking file writer when a log directory is
//! configured, otherwise to stderr. `RUST_LOG` overrides the configured filter.

use std::fs;
use std::path::PathBuf;

use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::EnvFilter;

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "tilefetch.log";

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log directory could not be created.
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A global subscriber is already installed.
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory for `tilefetch.log`; `None` logs to stderr.
    pub directory: Option<PathBuf>,
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            default_filter: "info,tilefetch=debug".to_string(),
        }
    }
}

/// Keeps the background log writer alive.
///
/// Dropping the guard flushes buffered log lines.
pub struct LoggingGuard {
    _worker: Option<WorkerGuard>,
    log_file: Option<PathBuf>,
}

impl LoggingGuard {
    /// Path of the active log file, if logging to a file.
    pub fn log_file(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }
}

/// Install the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let timer = LocalTime::new(Rfc3339);

    match &config.directory {
        Some(dir) => {
            fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDir {
                path: dir.clone(),
                source,
            })?;

            let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_timer(timer)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| LoggingError::Install(e.to_string()))?;

            let log_file = dir.join(LOG_FILE_NAME);
            tracing::info!(path = %log_file.display(), "Logging initialized");

            Ok(LoggingGuard {
                _worker: Some(guard),
                log_file: Some(log_file),
            })
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_timer(timer)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| LoggingError::Install(e.to_string()))?;

            Ok(LoggingGuard {
                _worker: None,
                log_file: None,
            })
        }
    }
}
