//! CLI error type.

use std::path::PathBuf;

use thiserror::Error;
use tilefetch::config::ConfigError;
use tilefetch::logging::LoggingError;
use tilefetch::{AbortReason, StorageError};

/// Errors surfaced to the user by the `tilefetch` binary.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to read URL list {path}: {source}")]
    UrlList {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to create HTTP client: {0}")]
    Http(String),

    #[error("failed to start async runtime: {0}")]
    Runtime(std::io::Error),

    #[error("failed to install Ctrl-C handler: {0}")]
    Signal(String),

    #[error("region {region} aborted: {reason}")]
    Aborted { region: String, reason: AbortReason },

    #[error("region {0} was fetched but the commit failed")]
    CommitFailed(String),

    #[error("another fetch is already running")]
    AlreadyRunning,
}
