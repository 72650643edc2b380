//! Region fetch coordinator.
//!
//! [`RegionFetcher`] owns the operation state, the abort signal of the
//! running operation and the three broadcast channels observers subscribe
//! to. It drives one region through plan, fetch and then either commit or
//! cleanup.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::error::AbortReason;
use super::planner::{FetchPlan, PowerLawSizing, SizingStrategy};
use super::progress::{Progress, ProgressAggregator};
use super::retry::RetryFetcher;
use super::scheduler::Scheduler;
use super::signal::AbortSignal;
use super::state::OperationState;
use crate::config::{ConfigError, FetchConfig};
use crate::provider::TileClient;
use crate::region::Region;
use crate::store::{CleanupStats, TileStore};

/// Capacity of the abort and commit channels.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 16;

/// Sent once for every aborted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortNotification {
    pub region_id: String,
    pub reason: AbortReason,
}

/// Sent once for every operation that reached the commit step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNotification {
    pub region_id: String,
    /// Result of the commit transaction.
    pub committed: bool,
}

/// Result of one `fetch()` call.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every tile was satisfied and a commit was attempted.
    Committed { committed: bool, progress: Progress },
    /// The operation was aborted and temporary storage cleaned up.
    Aborted {
        reason: AbortReason,
        progress: Progress,
    },
    /// Another operation was already running; nothing was done.
    AlreadyRunning,
}

impl RunOutcome {
    /// Whether the region was committed successfully.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { committed: true, .. })
    }

    /// The abort reason, if the operation was aborted.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::Aborted { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    state: OperationState,
    signal: Option<Arc<AbortSignal>>,
    /// Region of the most recent operation.
    last_region: Option<String>,
    /// An abort notification went out since the last operation started.
    abort_notified: bool,
}

/// Marks the current operation as abandoned if dropped before it finishes.
///
/// Dropping the `fetch()` future drops the worker pool with it. The guard
/// raises the signal, then flushes and cleans up the store on a spawned task
/// before moving to `Aborted`.
struct ActiveRun<'a> {
    fetcher: &'a RegionFetcher,
    signal: Arc<AbortSignal>,
    region_id: String,
    done: bool,
}

impl ActiveRun<'_> {
    fn finish(mut self, state: OperationState) {
        self.done = true;
        let mut lifecycle = self.fetcher.lifecycle.lock();
        lifecycle.state = state;
        lifecycle.signal = None;
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.signal.raise(AbortReason::Manual);
        let reason = self.signal.reason().unwrap_or(AbortReason::Manual);
        let purge = self.signal.purge_requested() || self.fetcher.config.purge_unlinked_on_abort;
        warn!(region = %self.region_id, reason = %reason, "Fetch dropped before finishing");

        self.fetcher.lifecycle.lock().state = OperationState::Aborting;

        let store = Arc::clone(&self.fetcher.store);
        let lifecycle = Arc::clone(&self.fetcher.lifecycle);
        let abort_tx = self.fetcher.abort_tx.clone();
        let notification = AbortNotification {
            region_id: self.region_id.clone(),
            reason,
        };
        let settle = move || {
            let mut lifecycle = lifecycle.lock();
            lifecycle.state = OperationState::Aborted;
            lifecycle.signal = None;
            lifecycle.abort_notified = true;
            let _ = abort_tx.send(notification);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    rollback_store(store.as_ref(), purge).await;
                    settle();
                });
            }
            Err(_) => {
                warn!("No runtime to clean up abandoned fetch");
                settle();
            }
        }
    }
}

/// Fetches whole regions into a [`TileStore`].
///
/// One operation runs at a time. Observers subscribe to progress, abort and
/// commit notifications; a subscriber that falls behind on the progress
/// channel loses the oldest updates, not the latest.
pub struct RegionFetcher {
    store: Arc<dyn TileStore>,
    client: Arc<dyn TileClient>,
    config: FetchConfig,
    sizing: Arc<dyn SizingStrategy>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    progress_tx: broadcast::Sender<Progress>,
    abort_tx: broadcast::Sender<AbortNotification>,
    commit_tx: broadcast::Sender<CommitNotification>,
}

impl RegionFetcher {
    /// Create a fetcher using the default power-law sizing.
    pub fn new(
        store: Arc<dyn TileStore>,
        client: Arc<dyn TileClient>,
        config: FetchConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (progress_tx, _) = broadcast::channel(config.progress_channel_capacity);
        let (abort_tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let (commit_tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);

        Ok(Self {
            store,
            client,
            config,
            sizing: Arc::new(PowerLawSizing::default()),
            lifecycle: Arc::new(Mutex::new(Lifecycle::default())),
            progress_tx,
            abort_tx,
            commit_tx,
        })
    }

    /// Replace the worker sizing strategy.
    pub fn with_sizing(mut self, sizing: Arc<dyn SizingStrategy>) -> Self {
        self.sizing = sizing;
        self
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Current operation state.
    pub fn state(&self) -> OperationState {
        self.lifecycle.lock().state
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<Progress> {
        self.progress_tx.subscribe()
    }

    pub fn subscribe_abort(&self) -> broadcast::Receiver<AbortNotification> {
        self.abort_tx.subscribe()
    }

    pub fn subscribe_commit(&self) -> broadcast::Receiver<CommitNotification> {
        self.commit_tx.subscribe()
    }

    /// How `region` would be fetched, without fetching it.
    pub fn plan(&self, region: &Region) -> FetchPlan {
        FetchPlan::compute(region.tile_count(), &self.config, self.sizing.as_ref())
    }

    /// Fetch every tile of `region`, then commit it or roll back.
    ///
    /// Returns [`RunOutcome::AlreadyRunning`] without side effects if another
    /// operation is active.
    pub async fn fetch(&self, region: &Region) -> RunOutcome {
        let signal = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state.is_active() {
                info!(
                    region = region.id(),
                    state = %lifecycle.state,
                    "Fetch requested while another operation is running"
                );
                return RunOutcome::AlreadyRunning;
            }
            let signal = Arc::new(AbortSignal::new());
            lifecycle.state = OperationState::Fetching;
            lifecycle.signal = Some(Arc::clone(&signal));
            lifecycle.last_region = Some(region.id().to_string());
            lifecycle.abort_notified = false;
            signal
        };
        let run = ActiveRun {
            fetcher: self,
            signal: Arc::clone(&signal),
            region_id: region.id().to_string(),
            done: false,
        };

        let plan = self.plan(region);
        info!(
            region = region.id(),
            tiles = plan.tile_count,
            workers = plan.worker_count,
            partitions = plan.partition_count,
            partition_size = plan.partition_size,
            "Starting region fetch"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let aggregator =
            ProgressAggregator::new(region.tile_count(), self.progress_tx.clone()).spawn(events_rx);

        let fetcher = Arc::new(RetryFetcher::from_config(
            Arc::clone(&self.client),
            &self.config,
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&self.store),
            fetcher,
            self.config.max_total_storage_bytes,
        );
        let summary = scheduler
            .run(region, &plan, Arc::clone(&signal), events_tx)
            .await;

        let progress = match aggregator.await {
            Ok(progress) => progress,
            Err(e) => {
                warn!(error = %e, "Progress aggregator failed");
                Progress::start(region.tile_count())
            }
        };

        let sealed = {
            let mut lifecycle = self.lifecycle.lock();
            let sealed = signal.seal();
            lifecycle.state = if sealed {
                OperationState::Completing
            } else {
                OperationState::Aborting
            };
            sealed
        };

        if sealed {
            info!(
                region = region.id(),
                fetched = summary.tiles_fetched(),
                reused = summary.tiles_reused(),
                bytes = progress.cumulative_bytes_fetched,
                "All tiles satisfied, committing region"
            );

            let committed = self.commit(region).await;
            run.finish(OperationState::Committed);
            let _ = self.commit_tx.send(CommitNotification {
                region_id: region.id().to_string(),
                committed,
            });

            RunOutcome::Committed {
                committed,
                progress,
            }
        } else {
            // A reason is always recorded before the signal is raised
            let reason = signal.reason().unwrap_or(AbortReason::Manual);
            if let Some(e) = &summary.first_error {
                warn!(region = region.id(), reason = %reason, error = %e, "Region fetch aborted");
            } else {
                warn!(region = region.id(), reason = %reason, "Region fetch aborted");
            }

            let purge = signal.purge_requested() || self.config.purge_unlinked_on_abort;
            rollback_store(self.store.as_ref(), purge).await;
            self.lifecycle.lock().abort_notified = true;
            run.finish(OperationState::Aborted);
            let _ = self.abort_tx.send(AbortNotification {
                region_id: region.id().to_string(),
                reason,
            });

            RunOutcome::Aborted { reason, progress }
        }
    }

    /// Abort the running operation, or clean up temporary storage if none
    /// is running.
    ///
    /// With no operation running, cleanup is followed by a
    /// [`AbortReason::Manual`] notification, unless the last operation
    /// already sent one. Never fails. Returns `true` if a running fetch was
    /// signalled.
    pub async fn abort(&self, purge_unlinked: bool) -> bool {
        {
            let lifecycle = self.lifecycle.lock();
            match (lifecycle.state, &lifecycle.signal) {
                (OperationState::Fetching, Some(signal)) => {
                    if purge_unlinked {
                        signal.request_purge();
                    }
                    let raised = signal.raise(AbortReason::Manual);
                    if raised {
                        info!(purge_unlinked, "Manual abort requested");
                    } else {
                        debug!("Abort already in progress");
                    }
                    return raised || signal.reason().is_some();
                }
                (OperationState::Completing | OperationState::Aborting, _) => {
                    debug!(state = %lifecycle.state, "Abort ignored, operation is finishing");
                    return false;
                }
                _ => {}
            }
        }

        cleanup_store(self.store.as_ref(), purge_unlinked).await;

        let region_id = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state.is_active() || lifecycle.abort_notified {
                return false;
            }
            lifecycle.abort_notified = true;
            lifecycle.last_region.clone().unwrap_or_default()
        };
        info!(region = %region_id, "Abort requested with no operation running");
        let _ = self.abort_tx.send(AbortNotification {
            region_id,
            reason: AbortReason::Manual,
        });
        false
    }

    async fn commit(&self, region: &Region) -> bool {
        if let Err(e) = self.store.flush().await {
            warn!(region = region.id(), error = %e, "Outstanding writes failed, region not committed");
            return false;
        }
        match self.store.commit_region(region).await {
            Ok(true) => {
                info!(region = region.id(), "Region committed");
                true
            }
            Ok(false) => {
                warn!(region = region.id(), "Commit rejected by storage");
                false
            }
            Err(e) => {
                warn!(region = region.id(), error = %e, "Commit failed");
                false
            }
        }
    }
}

async fn rollback_store(store: &dyn TileStore, purge_unlinked: bool) {
    if let Err(e) = store.flush().await {
        warn!(error = %e, "Outstanding writes failed during abort");
    }
    cleanup_store(store, purge_unlinked).await;
}

async fn cleanup_store(store: &dyn TileStore, purge_unlinked: bool) -> Option<CleanupStats> {
    match store.cleanup_temporary(purge_unlinked).await {
        Ok(stats) => {
            info!(purge_unlinked, %stats, "Temporary storage cleaned up");
            Some(stats)
        }
        Err(e) => {
            warn!(purge_unlinked, error = %e, "Temporary storage cleanup failed");
            None
        }
    }
}
