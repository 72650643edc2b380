//! Partition worker.
//!
//! A worker owns one contiguous partition of the region's URLs. It looks the
//! whole partition up in storage once, then walks it in order:
//!
//! 1. Tiles already stored are reported as reused and skipped.
//! 2. Missing tiles go through the [`RetryFetcher`] into the worker's
//!    [`WriteBatch`].
//! 3. After each fetched tile the quota is checked against stored plus
//!    in-flight bytes, and a full batch is handed to storage.
//!
//! Whatever remains in the batch is flushed when the partition ends, and
//! also on cooperative cancellation. A quota overrun discards the batch.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::batch::WriteBatch;
use super::error::{FetchError, FetchResult};
use super::progress::{ProgressSender, TileCompleted};
use super::retry::{FetchOutcome, RetryFetcher};
use super::signal::AbortSignal;
use crate::store::TileStore;

/// How a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Every URL in the partition was handled.
    Completed,
    /// The abort signal stopped the worker early.
    Cancelled,
}

/// Counters reported by a finished worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub exit: WorkerExit,
    pub fetched: usize,
    pub reused: usize,
    pub bytes_fetched: u64,
    pub batches_flushed: usize,
}

impl WorkerReport {
    fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            exit: WorkerExit::Completed,
            fetched: 0,
            reused: 0,
            bytes_fetched: 0,
            batches_flushed: 0,
        }
    }
}

/// Dependencies shared by every worker of one operation.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn TileStore>,
    pub fetcher: Arc<RetryFetcher>,
    pub signal: Arc<AbortSignal>,
    pub progress: ProgressSender,
    pub max_total_storage_bytes: u64,
}

/// Fetches one partition.
pub struct Worker {
    id: usize,
    partition: Vec<String>,
    batch: WriteBatch,
    ctx: WorkerContext,
    report: WorkerReport,
}

impl Worker {
    pub fn new(id: usize, partition: Vec<String>, batch_budget: u64, ctx: WorkerContext) -> Self {
        Self {
            id,
            partition,
            batch: WriteBatch::new(batch_budget),
            ctx,
            report: WorkerReport::new(id),
        }
    }

    /// Process the partition.
    ///
    /// Any terminal error raises the shared abort signal with the matching
    /// reason before it is returned.
    #[instrument(skip(self), fields(worker = self.id, tiles = self.partition.len()))]
    pub async fn run(mut self) -> FetchResult<WorkerReport> {
        match self.process().await {
            Ok(()) => {
                debug!(
                    fetched = self.report.fetched,
                    reused = self.report.reused,
                    batches = self.report.batches_flushed,
                    exit = ?self.report.exit,
                    "Worker finished"
                );
                Ok(self.report)
            }
            Err(e) => {
                self.ctx.signal.raise(e.abort_reason());
                Err(e)
            }
        }
    }

    async fn process(&mut self) -> FetchResult<()> {
        if self.ctx.signal.is_raised() {
            self.report.exit = WorkerExit::Cancelled;
            return Ok(());
        }

        let existing = self.ctx.store.bulk_lookup(&self.partition).await?;
        let partition = std::mem::take(&mut self.partition);

        for (url, stored) in partition.into_iter().zip(existing) {
            if self.ctx.signal.is_raised() {
                self.report.exit = WorkerExit::Cancelled;
                break;
            }

            if let Some(tile) = stored {
                self.report.reused += 1;
                self.emit(url, tile.size_bytes(), true);
                continue;
            }

            let tile = match self.ctx.fetcher.fetch(&url, &self.ctx.signal).await {
                Ok(FetchOutcome::Fetched(tile)) => tile,
                Ok(FetchOutcome::Cancelled) => {
                    self.report.exit = WorkerExit::Cancelled;
                    break;
                }
                Err(e) => {
                    // Keep what was fetched so a later run can reuse it
                    if let Err(flush_err) = self.flush().await {
                        warn!(error = %flush_err, "Flush after fetch failure failed");
                    }
                    return Err(e);
                }
            };

            let size = tile.size_bytes();
            self.batch.push(tile);
            self.report.fetched += 1;
            self.report.bytes_fetched += size;
            self.emit(url, size, false);

            self.check_quota()?;

            if self.batch.is_full() {
                self.flush().await?;
            }
        }

        self.flush().await
    }

    fn check_quota(&mut self) -> FetchResult<()> {
        let stored = self.ctx.store.current_total_bytes();
        let in_flight = self.batch.bytes();
        let limit = self.ctx.max_total_storage_bytes;

        if stored.saturating_add(in_flight) > limit {
            let dropped = self.batch.discard();
            warn!(stored, in_flight, limit, dropped, "Storage quota exceeded");
            return Err(FetchError::StorageQuotaExceeded {
                stored,
                in_flight,
                limit,
            });
        }
        Ok(())
    }

    async fn flush(&mut self) -> FetchResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let bytes = self.batch.bytes();
        let tiles = self.batch.take();
        let count = tiles.len();

        self.ctx.store.queue_batch_write(tiles).await?;
        self.report.batches_flushed += 1;
        debug!(tiles = count, bytes, "Batch queued for write");
        Ok(())
    }

    fn emit(&self, url: String, bytes: u64, reused: bool) {
        let _ = self.ctx.progress.send(TileCompleted { url, bytes, reused });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::fetch::error::AbortReason;
    use crate::fetch::retry::BackoffPolicy;
    use crate::provider::{MockResponse, MockTileClient, TileClient};
    use crate::region::Tile;
    use crate::store::MemoryTileStore;

    struct Harness {
        store: Arc<MemoryTileStore>,
        client: Arc<MockTileClient>,
        signal: Arc<AbortSignal>,
        events: mpsc::UnboundedReceiver<TileCompleted>,
        ctx: WorkerContext,
    }

    fn harness(store: MemoryTileStore, client: MockTileClient, quota: u64) -> Harness {
        let store = Arc::new(store);
        let client = Arc::new(client);
        let signal = Arc::new(AbortSignal::new());
        let (tx, events) = mpsc::unbounded_channel();
        let fetcher = RetryFetcher::new(
            Arc::clone(&client) as Arc<dyn TileClient>,
            BackoffPolicy::new(2, Duration::ZERO, Duration::ZERO),
            Duration::from_millis(100),
        );
        let ctx = WorkerContext {
            store: Arc::clone(&store) as Arc<dyn TileStore>,
            fetcher: Arc::new(fetcher),
            signal: Arc::clone(&signal),
            progress: tx,
            max_total_storage_bytes: quota,
        };
        Harness {
            store,
            client,
            signal,
            events,
            ctx,
        }
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_fetches_and_flushes_partition() {
        let h = harness(
            MemoryTileStore::new(),
            MockTileClient::new(MockResponse::Data(vec![0u8; 10])),
            u64::MAX,
        );
        let worker = Worker::new(0, urls(&["a", "b", "c"]), 1_000, h.ctx.clone());

        let report = worker.run().await.unwrap();

        assert_eq!(report.exit, WorkerExit::Completed);
        assert_eq!(report.fetched, 3);
        assert_eq!(report.bytes_fetched, 30);
        assert_eq!(report.batches_flushed, 1);
        assert_eq!(h.store.batch_writes()[0].urls, urls(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn test_full_batches_flush_early() {
        let h = harness(
            MemoryTileStore::new(),
            MockTileClient::new(MockResponse::Data(vec![0u8; 10])),
            u64::MAX,
        );
        let worker = Worker::new(0, urls(&["a", "b", "c", "d", "e"]), 20, h.ctx.clone());

        let report = worker.run().await.unwrap();

        let batches = h.store.batch_writes();
        assert_eq!(report.batches_flushed, 3);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].bytes, 20);
        assert_eq!(batches[2].urls, urls(&["e"]));
    }

    #[tokio::test]
    async fn test_reuses_stored_tiles() {
        let store = MemoryTileStore::with_tiles(vec![Tile::new("b", vec![0u8; 7])]);
        let mut h = harness(
            store,
            MockTileClient::new(MockResponse::Data(vec![0u8; 10])),
            u64::MAX,
        );
        let worker = Worker::new(0, urls(&["a", "b"]), 1_000, h.ctx.clone());

        let report = worker.run().await.unwrap();

        assert_eq!(report.reused, 1);
        assert_eq!(h.client.calls_for("b"), 0);
        let first = h.events.recv().await.unwrap();
        let second = h.events.recv().await.unwrap();
        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(second.bytes, 7);
    }

    #[tokio::test]
    async fn test_quota_overrun_raises_storage_full() {
        let store = MemoryTileStore::with_tiles(vec![Tile::new("old", vec![0u8; 90])]);
        let h = harness(
            store,
            MockTileClient::new(MockResponse::Data(vec![0u8; 20])),
            100,
        );
        let worker = Worker::new(0, urls(&["a", "b"]), 1_000, h.ctx.clone());

        let err = worker.run().await.unwrap_err();

        assert!(matches!(err, FetchError::StorageQuotaExceeded { .. }));
        assert_eq!(h.signal.reason(), Some(AbortReason::StorageFull));
        assert!(h.store.batch_writes().is_empty());
        assert_eq!(h.client.calls_for("b"), 0);
    }

    #[tokio::test]
    async fn test_exhausted_tile_flushes_previous_work() {
        let client = MockTileClient::new(MockResponse::Data(vec![0u8; 5]))
            .script("bad", vec![MockResponse::Fail]);
        let h = harness(MemoryTileStore::new(), client, u64::MAX);
        let worker = Worker::new(0, urls(&["a", "bad", "c"]), 1_000, h.ctx.clone());

        let err = worker.run().await.unwrap_err();

        assert!(matches!(err, FetchError::TileFetchExhausted { .. }));
        assert_eq!(h.signal.reason(), Some(AbortReason::FetchTimeout));
        assert!(h.store.contains("a"));
        assert_eq!(h.client.calls_for("c"), 0);
    }

    #[tokio::test]
    async fn test_raised_signal_stops_before_start() {
        let h = harness(
            MemoryTileStore::new(),
            MockTileClient::new(MockResponse::Data(vec![1])),
            u64::MAX,
        );
        h.signal.raise(AbortReason::Manual);
        let worker = Worker::new(0, urls(&["a"]), 1_000, h.ctx.clone());

        let report = worker.run().await.unwrap();

        assert_eq!(report.exit, WorkerExit::Cancelled);
        assert_eq!(h.client.total_calls(), 0);
    }
}
