//! Per-tile retry loop.
//!
//! Every transport failure is treated as retryable. Each attempt is bounded by
//! the per-attempt timeout; between attempts the fetcher waits an
//! exponentially growing delay, abandoning the tile as soon as the abort
//! signal is raised. An attempt already in flight is never preempted.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::error::{FetchError, FetchResult};
use super::signal::AbortSignal;
use crate::config::FetchConfig;
use crate::provider::{TileClient, TransportError};
use crate::region::Tile;

/// Multiplier applied to the delay after each failed attempt.
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Result of fetching one tile.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The tile was retrieved.
    Fetched(Tile),
    /// The abort signal was raised before the tile was retrieved.
    Cancelled,
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl BackoffPolicy {
    /// Create a policy allowing `max_attempts` attempts in total.
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the retry following failed attempt `attempt` (1-based).
    ///
    /// Returns `None` once no attempts remain.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = BACKOFF_MULTIPLIER.powi(attempt.saturating_sub(1) as i32);
        let delay_ms = self.initial_delay.as_millis() as f64 * factor;
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }
}

/// Fetches single tiles through a [`TileClient`], retrying on failure.
pub struct RetryFetcher {
    client: Arc<dyn TileClient>,
    policy: BackoffPolicy,
    timeout: Duration,
}

impl RetryFetcher {
    /// Create a fetcher with an explicit policy and per-attempt timeout.
    pub fn new(client: Arc<dyn TileClient>, policy: BackoffPolicy, timeout: Duration) -> Self {
        Self {
            client,
            policy,
            timeout,
        }
    }

    /// Create a fetcher from the attempt settings of a [`FetchConfig`].
    pub fn from_config(client: Arc<dyn TileClient>, config: &FetchConfig) -> Self {
        let policy = BackoffPolicy::new(
            config.max_attempts_per_tile,
            config.retry_backoff,
            config.max_retry_backoff,
        );
        Self::new(client, policy, config.per_attempt_timeout)
    }

    /// The backoff policy in use.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Fetch `url`, retrying up to the attempt limit.
    ///
    /// Returns `Cancelled` if the signal is raised between attempts, and
    /// `TileFetchExhausted` once every attempt has failed.
    pub async fn fetch(&self, url: &str, signal: &AbortSignal) -> FetchResult<FetchOutcome> {
        let mut last_error = None;

        for attempt in 1..=self.policy.max_attempts() {
            if signal.is_raised() {
                trace!(url, attempt, "Abort raised before attempt");
                return Ok(FetchOutcome::Cancelled);
            }

            let result =
                tokio::time::timeout(self.timeout, self.client.get_bytes(url, self.timeout)).await;

            let error = match result {
                Ok(Ok(data)) => {
                    trace!(url, attempt, bytes = data.len(), "Tile fetched");
                    return Ok(FetchOutcome::Fetched(Tile::new(url, data)));
                }
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout {
                    url: url.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                },
            };

            debug!(
                url,
                attempt,
                max_attempts = self.policy.max_attempts(),
                error = %error,
                "Tile attempt failed"
            );
            last_error = Some(error);

            if let Some(delay) = self.policy.delay_for_attempt(attempt) {
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = signal.cancelled() => return Ok(FetchOutcome::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if signal.is_raised() {
            return Ok(FetchOutcome::Cancelled);
        }

        Err(FetchError::TileFetchExhausted {
            url: url.to_string(),
            attempts: self.policy.max_attempts(),
            last_error: last_error.unwrap_or_else(|| TransportError::Timeout {
                url: url.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::error::AbortReason;
    use crate::provider::{MockResponse, MockTileClient};

    fn fetcher(client: Arc<MockTileClient>, attempts: u32) -> RetryFetcher {
        RetryFetcher::new(
            client,
            BackoffPolicy::new(attempts, Duration::ZERO, Duration::ZERO),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::new(5, Duration::from_millis(100), Duration::from_millis(300));

        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_millis(300)));
        assert_eq!(policy.delay_for_attempt(4), Some(Duration::from_millis(300)));
        assert_eq!(policy.delay_for_attempt(5), None);
    }

    #[test]
    fn test_backoff_single_attempt() {
        let policy = BackoffPolicy::new(1, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), None);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let client = Arc::new(MockTileClient::new(MockResponse::Fail).script(
            "http://a",
            vec![
                MockResponse::Fail,
                MockResponse::Fail,
                MockResponse::Data(vec![1, 2]),
            ],
        ));
        let signal = AbortSignal::new();

        let outcome = fetcher(Arc::clone(&client), 3)
            .fetch("http://a", &signal)
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Fetched(tile) => assert_eq!(tile.size_bytes(), 2),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(client.calls_for("http://a"), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let client = Arc::new(MockTileClient::new(MockResponse::Fail));
        let signal = AbortSignal::new();

        let err = fetcher(Arc::clone(&client), 2)
            .fetch("http://a", &signal)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FetchError::TileFetchExhausted { attempts: 2, .. }
        ));
        assert_eq!(client.calls_for("http://a"), 2);
    }

    #[tokio::test]
    async fn test_hanging_attempt_times_out() {
        let client = Arc::new(MockTileClient::new(MockResponse::Hang));
        let signal = AbortSignal::new();

        let err = fetcher(client, 1)
            .fetch("http://a", &signal)
            .await
            .unwrap_err();

        match err {
            FetchError::TileFetchExhausted { last_error, .. } => assert!(last_error.is_timeout()),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_raised_signal_skips_network() {
        let client = Arc::new(MockTileClient::new(MockResponse::Data(vec![1])));
        let signal = AbortSignal::new();
        signal.raise(AbortReason::Manual);

        let outcome = fetcher(Arc::clone(&client), 3)
            .fetch("http://a", &signal)
            .await
            .unwrap();

        assert!(matches!(outcome, FetchOutcome::Cancelled));
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_abort_during_backoff() {
        let client = Arc::new(MockTileClient::new(MockResponse::Fail));
        let signal = Arc::new(AbortSignal::new());
        let fetcher = RetryFetcher::new(
            Arc::clone(&client) as Arc<dyn TileClient>,
            BackoffPolicy::new(3, Duration::from_secs(60), Duration::from_secs(60)),
            Duration::from_millis(50),
        );

        let raiser = Arc::clone(&signal);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            raiser.raise(AbortReason::Manual);
        });

        let outcome = fetcher.fetch("http://a", &signal).await.unwrap();

        assert!(matches!(outcome, FetchOutcome::Cancelled));
        assert_eq!(client.calls_for("http://a"), 1);
    }
}
