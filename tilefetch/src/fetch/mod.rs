//! Region fetch engine.
//!
//! Fetches every tile of a [`Region`](crate::region::Region) into a
//! [`TileStore`](crate::store::TileStore) and commits the region only if all
//! of them were acquired within the storage quota.
//!
//! # Architecture
//!
//! ```text
//! RegionFetcher::fetch(region)
//!        │
//!        ▼
//!   FetchPlan ──── SizingStrategy (workers = (n+1)^0.375, clamped)
//!        │
//!        ▼
//!   Scheduler ──── Semaphore(worker_count) + JoinSet
//!        │
//!        ├── Worker 0 ─┐
//!        ├── Worker 1 ─┼── bulk lookup ─► RetryFetcher ─► WriteBatch ─► queue_batch_write
//!        └── Worker N ─┘        │
//!                               └── TileCompleted ─► ProgressAggregator ─► broadcast<Progress>
//!        │
//!        ▼
//!   AbortSignal sealed?  ── yes ─► flush + commit_region ─► broadcast<CommitNotification>
//!                        └─ no ──► flush + cleanup_temporary ─► broadcast<AbortNotification>
//! ```
//!
//! Any terminal worker error, a quota overrun or a manual `abort()` raises
//! the shared [`AbortSignal`]. The first reason recorded is the one reported.

mod batch;
mod coordinator;
mod error;
mod planner;
mod progress;
mod retry;
mod scheduler;
mod signal;
mod state;
mod worker;

pub use batch::WriteBatch;
pub use coordinator::{AbortNotification, CommitNotification, RegionFetcher, RunOutcome};
pub use error::{AbortReason, FetchError, FetchResult};
pub use planner::{FetchPlan, FnSizing, PowerLawSizing, SizingStrategy, DEFAULT_SIZING_EXPONENT};
pub use progress::{Progress, ProgressAggregator, ProgressSender, TileCompleted};
pub use retry::{BackoffPolicy, FetchOutcome, RetryFetcher};
pub use scheduler::{ScheduleSummary, Scheduler};
pub use signal::AbortSignal;
pub use state::OperationState;
pub use worker::{Worker, WorkerContext, WorkerExit, WorkerReport};
