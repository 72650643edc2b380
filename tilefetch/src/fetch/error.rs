//! Fetch engine error types and abort reasons.

use std::fmt;

use thiserror::Error;

use crate::provider::TransportError;
use crate::store::StorageError;

/// Result type for fetch engine operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Why a fetch operation was aborted.
///
/// Recorded at most once per operation; the first cause wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// Aborted by an external `abort()` call.
    Manual,
    /// A tile could not be fetched within its attempt limit.
    FetchTimeout,
    /// Fetched bytes pushed stored size over the quota.
    StorageFull,
    /// The tile store failed to read or write.
    StorageFailure,
}

impl AbortReason {
    /// Short lowercase label for logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::FetchTimeout => "fetch-timeout",
            Self::StorageFull => "storage-full",
            Self::StorageFailure => "storage-failure",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal errors that abort a whole fetch operation.
///
/// Retryable transport failures never surface here; they are contained in
/// the retry fetcher until the attempt limit is reached.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Every attempt for a tile failed.
    #[error("tile {url} failed after {attempts} attempts: {last_error}")]
    TileFetchExhausted {
        url: String,
        attempts: u32,
        last_error: TransportError,
    },

    /// Stored plus in-flight bytes exceeded the quota.
    #[error("storage quota exceeded: {stored} stored + {in_flight} in flight > {limit} bytes")]
    StorageQuotaExceeded {
        stored: u64,
        in_flight: u64,
        limit: u64,
    },

    /// The operation was cancelled by a manual abort.
    #[error("fetch cancelled")]
    Cancelled,

    /// The tile store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl FetchError {
    /// The abort reason this error maps to.
    pub fn abort_reason(&self) -> AbortReason {
        match self {
            Self::TileFetchExhausted { .. } => AbortReason::FetchTimeout,
            Self::StorageQuotaExceeded { .. } => AbortReason::StorageFull,
            Self::Cancelled => AbortReason::Manual,
            Self::Storage(_) => AbortReason::StorageFailure,
        }
    }
}
