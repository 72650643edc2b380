//! In-memory tile store.
//!
//! Keeps every tile, staging marker and region link in a single
//! `parking_lot::Mutex`. Useful for tests, dry runs and short-lived
//! processes. Records every applied batch so callers can inspect how the
//! engine paced its writes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use super::traits::{BoxFuture, CleanupStats, StorageError, StorageResult, TileStore};
use crate::region::{Region, Tile};

/// Record of one applied batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    /// URLs in the batch, in write order.
    pub urls: Vec<String>,
    /// Total payload bytes in the batch.
    pub bytes: u64,
}

#[derive(Debug)]
struct StoredTile {
    data: Bytes,
    staged: bool,
}

#[derive(Debug, Default)]
struct Inner {
    tiles: HashMap<String, StoredTile>,
    regions: HashMap<String, Vec<String>>,
    batches: Vec<BatchRecord>,
    commits: usize,
}

/// Tile store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryTileStore {
    inner: Mutex<Inner>,
    total_bytes: AtomicU64,
    fail_commits: AtomicBool,
}

impl MemoryTileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with unlinked, unstaged tiles.
    pub fn with_tiles(tiles: impl IntoIterator<Item = Tile>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            for tile in tiles {
                store.insert_locked(&mut inner, tile, false);
            }
        }
        store
    }

    /// Make every subsequent commit fail with a backend error.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Whether a tile is stored for `url`.
    pub fn contains(&self, url: &str) -> bool {
        self.inner.lock().tiles.contains_key(url)
    }

    /// Whether the tile for `url` carries a staging marker.
    pub fn is_staged(&self, url: &str) -> bool {
        self.inner
            .lock()
            .tiles
            .get(url)
            .map(|t| t.staged)
            .unwrap_or(false)
    }

    /// URLs linked to a committed region.
    pub fn region_urls(&self, region_id: &str) -> Option<Vec<String>> {
        self.inner.lock().regions.get(region_id).cloned()
    }

    /// Whether `url` is linked to `region_id`.
    pub fn is_linked(&self, url: &str, region_id: &str) -> bool {
        self.inner
            .lock()
            .regions
            .get(region_id)
            .map(|urls| urls.iter().any(|u| u == url))
            .unwrap_or(false)
    }

    /// Every batch applied so far, in application order.
    pub fn batch_writes(&self) -> Vec<BatchRecord> {
        self.inner.lock().batches.clone()
    }

    /// Number of commit transactions issued.
    pub fn commit_count(&self) -> usize {
        self.inner.lock().commits
    }

    /// Number of stored tiles.
    pub fn tile_count(&self) -> usize {
        self.inner.lock().tiles.len()
    }

    fn insert_locked(&self, inner: &mut Inner, tile: Tile, staged: bool) {
        let size = tile.size_bytes();
        let previous = inner.tiles.insert(
            tile.url,
            StoredTile {
                data: tile.data,
                staged,
            },
        );
        if let Some(old) = previous {
            self.total_bytes
                .fetch_sub(old.data.len() as u64, Ordering::SeqCst);
        }
        self.total_bytes.fetch_add(size, Ordering::SeqCst);
    }
}

impl TileStore for MemoryTileStore {
    fn bulk_lookup<'a>(
        &'a self,
        urls: &'a [String],
    ) -> BoxFuture<'a, StorageResult<Vec<Option<Tile>>>> {
        Box::pin(async move {
            let inner = self.inner.lock();
            Ok(urls
                .iter()
                .map(|url| {
                    inner
                        .tiles
                        .get(url)
                        .map(|stored| Tile::new(url.clone(), stored.data.clone()))
                })
                .collect())
        })
    }

    fn current_total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    fn queue_batch_write(&self, tiles: Vec<Tile>) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            let record = BatchRecord {
                urls: tiles.iter().map(|t| t.url.clone()).collect(),
                bytes: tiles.iter().map(Tile::size_bytes).sum(),
            };
            for tile in tiles {
                self.insert_locked(&mut inner, tile, true);
            }
            inner.batches.push(record);
            Ok(())
        })
    }

    fn flush(&self) -> BoxFuture<'_, StorageResult<()>> {
        // Batches are applied synchronously on queue
        Box::pin(async { Ok(()) })
    }

    fn commit_region<'a>(&'a self, region: &'a Region) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.commits += 1;

            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(StorageError::Backend(format!(
                    "commit of region {} rejected",
                    region.id()
                )));
            }

            if region.urls().iter().any(|url| !inner.tiles.contains_key(url)) {
                return Ok(false);
            }

            for url in region.urls() {
                if let Some(stored) = inner.tiles.get_mut(url) {
                    stored.staged = false;
                }
            }
            inner
                .regions
                .insert(region.id().to_string(), region.urls().to_vec());
            Ok(true)
        })
    }

    fn cleanup_temporary(&self, purge_unlinked: bool) -> BoxFuture<'_, StorageResult<CleanupStats>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            let mut stats = CleanupStats::default();

            for stored in inner.tiles.values_mut() {
                if stored.staged {
                    stored.staged = false;
                    stats.staging_cleared += 1;
                }
            }

            if purge_unlinked {
                let linked: HashSet<String> =
                    inner.regions.values().flatten().cloned().collect();
                let mut freed = 0u64;
                let before = inner.tiles.len();
                inner.tiles.retain(|url, stored| {
                    let keep = linked.contains(url);
                    if !keep {
                        freed += stored.data.len() as u64;
                    }
                    keep
                });
                stats.tiles_purged = before - inner.tiles.len();
                stats.bytes_freed = freed;
                self.total_bytes.fetch_sub(freed, Ordering::SeqCst);
            }

            Ok(stats)
        })
    }
}
