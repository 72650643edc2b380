//! Transport trait and error types.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::store::BoxFuture;

/// Errors from a single network attempt.
///
/// Every variant is retryable from the fetcher's point of view; the
/// distinction matters for logging and for telling timeouts apart.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The attempt did not complete within its timeout.
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    /// Connection-level failure (DNS, refused, reset, TLS).
    #[error("connection to {url} failed: {reason}")]
    Connection { url: String, reason: String },

    /// Server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    /// The response body could not be read.
    #[error("failed to read body from {url}: {reason}")]
    Body { url: String, reason: String },
}

impl TransportError {
    /// Whether this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Fetches raw bytes for one address.
///
/// Uses `Pin<Box<dyn Future>>` so clients can be held as `Arc<dyn TileClient>`.
pub trait TileClient: Send + Sync {
    /// Fetch `url`, giving up after `timeout`.
    ///
    /// Implementations must report an elapsed timeout as
    /// [`TransportError::Timeout`].
    fn get_bytes(&self, url: &str, timeout: Duration) -> BoxFuture<'_, Result<Bytes, TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        let timeout = TransportError::Timeout {
            url: "http://a".to_string(),
            timeout_ms: 5000,
        };
        let status = TransportError::Status {
            url: "http://a".to_string(),
            status: 503,
        };

        assert!(timeout.is_timeout());
        assert!(!status.is_timeout());
        assert_eq!(status.to_string(), "HTTP 503 from http://a");
    }
}
