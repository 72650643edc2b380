//! HTTP tile client backed by reqwest.

use std::time::Duration;

use bytes::Bytes;

use super::types::{TileClient, TransportError};
use crate::store::BoxFuture;

/// Connection timeout applied to the underlying client.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Real HTTP client implementation using async reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestTileClient {
    client: reqwest::Client,
}

impl ReqwestTileClient {
    /// Creates a client with default settings.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(concat!("tilefetch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }

    /// Wraps an existing reqwest client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn map_error(url: &str, timeout: Duration, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            TransportError::Connection {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

impl TileClient for ReqwestTileClient {
    fn get_bytes(&self, url: &str, timeout: Duration) -> BoxFuture<'_, Result<Bytes, TransportError>> {
        let url = url.to_string();
        Box::pin(async move {
            let response = self
                .client
                .get(&url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| Self::map_error(&url, timeout, e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Status {
                    url,
                    status: status.as_u16(),
                });
            }

            response.bytes().await.map_err(|e| {
                if e.is_timeout() {
                    Self::map_error(&url, timeout, e)
                } else {
                    TransportError::Body {
                        url: url.clone(),
                        reason: e.to_string(),
                    }
                }
            })
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    /// Scripted response for one attempt.
    #[derive(Debug, Clone)]
    pub enum MockResponse {
        /// Return these bytes.
        Data(Vec<u8>),
        /// Fail with a connection error.
        Fail,
        /// Never answer within any reasonable timeout.
        Hang,
    }

    /// Mock tile client with per-URL scripted responses.
    ///
    /// Each call pops the next scripted response for the URL; once the script
    /// is exhausted the last response repeats. Unscripted URLs get `default`.
    pub struct MockTileClient {
        scripts: Mutex<HashMap<String, VecDeque<MockResponse>>>,
        default: MockResponse,
        calls: Mutex<HashMap<String, usize>>,
        total_calls: AtomicUsize,
    }

    impl MockTileClient {
        /// Every URL answers with `default`.
        pub fn new(default: MockResponse) -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                default,
                calls: Mutex::new(HashMap::new()),
                total_calls: AtomicUsize::new(0),
            }
        }

        /// Script the responses for one URL.
        pub fn script(self, url: &str, responses: Vec<MockResponse>) -> Self {
            self.scripts
                .lock()
                .insert(url.to_string(), responses.into_iter().collect());
            self
        }

        /// Number of calls made for `url`.
        pub fn calls_for(&self, url: &str) -> usize {
            self.calls.lock().get(url).copied().unwrap_or(0)
        }

        /// Number of calls across all URLs.
        pub fn total_calls(&self) -> usize {
            self.total_calls.load(Ordering::SeqCst)
        }

        fn next_response(&self, url: &str) -> MockResponse {
            let mut scripts = self.scripts.lock();
            match scripts.get_mut(url) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(MockResponse::Fail),
                Some(queue) => queue.front().cloned().unwrap_or(MockResponse::Fail),
                None => self.default.clone(),
            }
        }
    }

    impl TileClient for MockTileClient {
        fn get_bytes(
            &self,
            url: &str,
            _timeout: Duration,
        ) -> BoxFuture<'_, Result<Bytes, TransportError>> {
            let url = url.to_string();
            Box::pin(async move {
                *self.calls.lock().entry(url.clone()).or_insert(0) += 1;
                self.total_calls.fetch_add(1, Ordering::SeqCst);

                match self.next_response(&url) {
                    MockResponse::Data(data) => Ok(Bytes::from(data)),
                    MockResponse::Fail => Err(TransportError::Connection {
                        url,
                        reason: "connection refused".to_string(),
                    }),
                    MockResponse::Hang => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Err(TransportError::Timeout {
                            url,
                            timeout_ms: 3_600_000,
                        })
                    }
                }
            })
        }
    }

    #[test]
    fn test_reqwest_client_new() {
        assert!(ReqwestTileClient::new().is_ok());
    }

    #[tokio::test]
    async fn test_mock_client_script_then_repeat() {
        let mock = MockTileClient::new(MockResponse::Fail).script(
            "http://a",
            vec![MockResponse::Fail, MockResponse::Data(vec![1, 2, 3])],
        );

        let timeout = Duration::from_secs(1);
        assert!(mock.get_bytes("http://a", timeout).await.is_err());
        assert_eq!(
            mock.get_bytes("http://a", timeout).await.unwrap(),
            Bytes::from(vec![1, 2, 3])
        );
        assert!(mock.get_bytes("http://a", timeout).await.is_ok());
        assert_eq!(mock.calls_for("http://a"), 3);
    }

    #[tokio::test]
    async fn test_mock_client_default() {
        let mock = MockTileClient::new(MockResponse::Data(vec![9]));

        let data = mock
            .get_bytes("http://unscripted", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(data.as_ref(), &[9]);
        assert_eq!(mock.total_calls(), 1);
    }
}
