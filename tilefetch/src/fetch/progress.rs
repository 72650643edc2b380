//! Progress aggregation.
//!
//! Workers report each finished tile as a [`TileCompleted`] event over an
//! unbounded mpsc channel. A single aggregator task folds those events into
//! a running [`Progress`] value and broadcasts it, so the published fraction
//! and byte count never decrease regardless of worker interleaving.

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::trace;

/// Aggregate progress of a fetch operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Completed tiles over total tiles, in `[0.0, 1.0]`.
    pub fraction_complete: f64,
    /// Bytes fetched over the network so far. Reused tiles do not count.
    pub cumulative_bytes_fetched: u64,
    /// Tiles finished, fetched or reused.
    pub completed_tiles: usize,
    /// Tiles in the region.
    pub total_tiles: usize,
}

impl Progress {
    /// Progress before any tile has finished.
    pub fn start(total_tiles: usize) -> Self {
        Self {
            fraction_complete: if total_tiles == 0 { 1.0 } else { 0.0 },
            cumulative_bytes_fetched: 0,
            completed_tiles: 0,
            total_tiles,
        }
    }

    /// Whether every tile has finished.
    pub fn is_complete(&self) -> bool {
        self.completed_tiles >= self.total_tiles
    }
}

/// A tile finished by a worker.
#[derive(Debug, Clone)]
pub struct TileCompleted {
    pub url: String,
    pub bytes: u64,
    /// The tile was already stored and was not fetched.
    pub reused: bool,
}

/// Sender half used by workers.
pub type ProgressSender = mpsc::UnboundedSender<TileCompleted>;

/// Folds tile events into progress updates.
#[derive(Debug)]
pub struct ProgressAggregator {
    current: Progress,
    tx: broadcast::Sender<Progress>,
}

impl ProgressAggregator {
    /// Create an aggregator for a region of `total_tiles` tiles.
    pub fn new(total_tiles: usize, tx: broadcast::Sender<Progress>) -> Self {
        Self {
            current: Progress::start(total_tiles),
            tx,
        }
    }

    /// Current aggregate progress.
    pub fn current(&self) -> Progress {
        self.current
    }

    /// Apply one event and publish the result.
    pub fn record(&mut self, event: &TileCompleted) -> Progress {
        let total = self.current.total_tiles;
        self.current.completed_tiles = (self.current.completed_tiles + 1).min(total);
        if !event.reused {
            self.current.cumulative_bytes_fetched += event.bytes;
        }
        self.current.fraction_complete = if total == 0 {
            1.0
        } else {
            self.current.completed_tiles as f64 / total as f64
        };

        trace!(
            url = %event.url,
            completed = self.current.completed_tiles,
            total,
            "Tile completed"
        );
        self.publish();
        self.current
    }

    /// Publish the current value. Having no subscribers is not an error.
    pub fn publish(&self) {
        let _ = self.tx.send(self.current);
    }

    /// Run the aggregator until every sender is dropped.
    ///
    /// Empty regions publish a single completed update immediately.
    /// Resolves to the final progress.
    pub fn spawn(mut self, mut rx: mpsc::UnboundedReceiver<TileCompleted>) -> JoinHandle<Progress> {
        tokio::spawn(async move {
            if self.current.total_tiles == 0 {
                self.publish();
            }
            while let Some(event) = rx.recv().await {
                self.record(&event);
            }
            self.current
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(bytes: u64, reused: bool) -> TileCompleted {
        TileCompleted {
            url: "http://a".to_string(),
            bytes,
            reused,
        }
    }

    #[test]
    fn test_record_accumulates() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut agg = ProgressAggregator::new(4, tx);

        agg.record(&event(100, false));
        let p = agg.record(&event(50, true));

        assert_eq!(p.completed_tiles, 2);
        assert_eq!(p.fraction_complete, 0.5);
        assert_eq!(p.cumulative_bytes_fetched, 100);
        assert_eq!(rx.try_recv().unwrap().completed_tiles, 1);
        assert_eq!(rx.try_recv().unwrap().completed_tiles, 2);
    }

    #[test]
    fn test_fraction_never_exceeds_one() {
        let (tx, _rx) = broadcast::channel(8);
        let mut agg = ProgressAggregator::new(1, tx);

        agg.record(&event(1, false));
        let p = agg.record(&event(1, false));

        assert_eq!(p.fraction_complete, 1.0);
        assert!(p.is_complete());
    }

    #[tokio::test]
    async fn test_spawned_aggregator_is_monotonic() {
        let (tx, mut rx) = broadcast::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = ProgressAggregator::new(10, tx).spawn(events_rx);

        for i in 0..10 {
            events_tx.send(event(i, i % 3 == 0)).unwrap();
        }
        drop(events_tx);
        let last = handle.await.unwrap();

        assert_eq!(last.fraction_complete, 1.0);
        let mut previous = Progress::start(10);
        while let Ok(p) = rx.try_recv() {
            assert!(p.fraction_complete >= previous.fraction_complete);
            assert!(p.cumulative_bytes_fetched >= previous.cumulative_bytes_fetched);
            previous = p;
        }
        assert_eq!(previous, last);
    }

    #[tokio::test]
    async fn test_empty_region_publishes_completion() {
        let (tx, mut rx) = broadcast::channel(4);
        let (events_tx, events_rx) = mpsc::unbounded_channel::<TileCompleted>();
        let handle = ProgressAggregator::new(0, tx).spawn(events_rx);
        drop(events_tx);

        handle.await.unwrap();

        let p = rx.recv().await.unwrap();
        assert_eq!(p.fraction_complete, 1.0);
        assert_eq!(p.cumulative_bytes_fetched, 0);
    }
}
