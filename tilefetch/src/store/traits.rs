//! Storage collaborator trait consumed by the fetch engine.
//!
//! The engine never touches record layout, indexing or durability directly;
//! it only needs the narrow set of operations below.
//!
//! # Staging and linking
//!
//! Tiles written through [`TileStore::queue_batch_write`] are *staged*: stored
//! but not yet part of any region. [`TileStore::commit_region`] links every
//! tile of a region to its id in one transaction. [`TileStore::cleanup_temporary`]
//! clears staging markers and can optionally delete tiles that ended up linked
//! to no region at all.
//!
//! # Dyn Compatibility
//!
//! Async methods return `Pin<Box<dyn Future>>` so stores can be used as
//! `Arc<dyn TileStore>`.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use thiserror::Error;

use crate::region::{Region, Tile};

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in a tile store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Region manifest could not be encoded or decoded.
    #[error("manifest error for region {region}: {reason}")]
    Manifest { region: String, reason: String },

    /// A background write task failed to complete.
    #[error("background write failed: {0}")]
    WriteTask(String),

    /// Backend-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Outcome of a temporary-storage cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Number of staging markers removed.
    pub staging_cleared: usize,
    /// Number of unlinked tiles deleted.
    pub tiles_purged: usize,
    /// Bytes freed by deleting unlinked tiles.
    pub bytes_freed: u64,
}

impl fmt::Display for CleanupStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cleared {} staging markers, purged {} tiles ({} bytes)",
            self.staging_cleared, self.tiles_purged, self.bytes_freed
        )
    }
}

/// Durable tile storage.
///
/// # Thread Safety
///
/// Stores are shared by every worker of a fetch operation and must be
/// `Send + Sync`. No exclusive lock is held by the engine: reads, size queries
/// and batch writes from different workers interleave freely.
pub trait TileStore: Send + Sync {
    /// Look up tiles by address.
    ///
    /// Returns a vector of the same length and order as `urls`; `None` marks
    /// an address with no stored record.
    fn bulk_lookup<'a>(
        &'a self,
        urls: &'a [String],
    ) -> BoxFuture<'a, StorageResult<Vec<Option<Tile>>>>;

    /// Total bytes currently stored across all tiles.
    ///
    /// Writes still queued and not yet applied may not be reflected.
    fn current_total_bytes(&self) -> u64;

    /// Queue a batch of tiles to be written as one unit.
    ///
    /// Returns once the batch is accepted; use [`TileStore::flush`] to wait
    /// for it to be durable.
    fn queue_batch_write(&self, tiles: Vec<Tile>) -> BoxFuture<'_, StorageResult<()>>;

    /// Wait for every queued batch write to finish.
    fn flush(&self) -> BoxFuture<'_, StorageResult<()>>;

    /// Link every tile of `region` to its id.
    ///
    /// Returns `Ok(false)` if the region cannot be committed (for example a
    /// tile is missing). Committing an already committed region succeeds.
    fn commit_region<'a>(&'a self, region: &'a Region) -> BoxFuture<'a, StorageResult<bool>>;

    /// Remove staging markers, optionally deleting tiles linked to no region.
    fn cleanup_temporary(&self, purge_unlinked: bool) -> BoxFuture<'_, StorageResult<CleanupStats>>;
}
