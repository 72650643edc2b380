//! Bounded worker pool.
//!
//! Every partition becomes one task in a `JoinSet`. A semaphore with
//! `worker_count` permits bounds how many run at once; the rest wait in
//! line. Once the abort signal is raised, tasks still waiting for a permit
//! are discarded without touching storage or the network.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use super::error::{AbortReason, FetchError};
use super::planner::FetchPlan;
use super::progress::ProgressSender;
use super::retry::RetryFetcher;
use super::signal::AbortSignal;
use super::worker::{Worker, WorkerContext, WorkerReport};
use crate::region::Region;
use crate::store::TileStore;

/// What the pool did for one region.
#[derive(Debug, Default)]
pub struct ScheduleSummary {
    /// Reports of workers that ran.
    pub reports: Vec<WorkerReport>,
    /// Partitions discarded before they started.
    pub skipped_partitions: usize,
    /// First terminal error observed, in completion order.
    pub first_error: Option<FetchError>,
    /// Worker tasks that panicked.
    pub panicked: usize,
}

impl ScheduleSummary {
    pub fn tiles_fetched(&self) -> usize {
        self.reports.iter().map(|r| r.fetched).sum()
    }

    pub fn tiles_reused(&self) -> usize {
        self.reports.iter().map(|r| r.reused).sum()
    }
}

/// Runs a region's partitions on a bounded pool.
pub struct Scheduler {
    store: Arc<dyn TileStore>,
    fetcher: Arc<RetryFetcher>,
    max_total_storage_bytes: u64,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TileStore>,
        fetcher: Arc<RetryFetcher>,
        max_total_storage_bytes: u64,
    ) -> Self {
        Self {
            store,
            fetcher,
            max_total_storage_bytes,
        }
    }

    /// Run every partition of `region` under `plan` and wait for all of them.
    ///
    /// `progress` is dropped once the last task finishes.
    pub async fn run(
        &self,
        region: &Region,
        plan: &FetchPlan,
        signal: Arc<AbortSignal>,
        progress: ProgressSender,
    ) -> ScheduleSummary {
        let permits = Arc::new(Semaphore::new(plan.worker_count));
        let mut tasks = JoinSet::new();

        let ctx = WorkerContext {
            store: Arc::clone(&self.store),
            fetcher: Arc::clone(&self.fetcher),
            signal: Arc::clone(&signal),
            progress,
            max_total_storage_bytes: self.max_total_storage_bytes,
        };

        for (id, partition) in plan.partitions(region.urls()).enumerate() {
            let worker = Worker::new(id, partition.to_vec(), plan.batch_heap_share, ctx.clone());
            let permits = Arc::clone(&permits);
            let signal = Arc::clone(&signal);

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = signal.cancelled() => return Ok(None),
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Ok(None),
                    },
                };
                if signal.is_raised() {
                    return Ok(None);
                }
                worker.run().await.map(Some)
            });
        }
        drop(ctx);

        let mut summary = ScheduleSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Some(report))) => summary.reports.push(report),
                Ok(Ok(None)) => summary.skipped_partitions += 1,
                Ok(Err(e)) => {
                    signal.raise(e.abort_reason());
                    if summary.first_error.is_none() {
                        summary.first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    error!(error = %join_err, "Worker task panicked");
                    signal.raise(AbortReason::FetchTimeout);
                    summary.panicked += 1;
                }
            }
        }

        debug!(
            region = region.id(),
            workers = summary.reports.len(),
            skipped = summary.skipped_partitions,
            fetched = summary.tiles_fetched(),
            reused = summary.tiles_reused(),
            "All partitions finished"
        );
        summary
    }
}
