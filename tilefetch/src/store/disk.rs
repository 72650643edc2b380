//! Disk-backed tile store.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── tiles/<sha256(url)>       tile payloads
//! ├── staging/<sha256(url)>     staging markers for uncommitted tiles
//! └── regions/<region>.json     committed region manifests
//! ```
//!
//! Batched writes run on the blocking thread pool. Each tile is written to a
//! temporary file and renamed into place, so readers never observe partial
//! payloads. Pending writes are tracked so [`TileStore::flush`] can await them.

use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::traits::{BoxFuture, CleanupStats, StorageError, StorageResult, TileStore};
use crate::region::{Region, Tile};

const TILES_DIR: &str = "tiles";
const STAGING_DIR: &str = "staging";
const REGIONS_DIR: &str = "regions";
const TEMP_SUFFIX: &str = ".tmp";

/// Manifest written when a region is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionManifest {
    /// Region identifier.
    pub id: String,
    /// Linked tile URLs, in region order.
    pub urls: Vec<String>,
    /// Total payload bytes of the linked tiles.
    pub total_bytes: u64,
    /// Commit time.
    pub committed_at: DateTime<Utc>,
}

/// Tile store persisted under a root directory.
pub struct DiskTileStore {
    root: PathBuf,
    total_bytes: Arc<AtomicU64>,
    queued_bytes: Arc<AtomicU64>,
    pending: Mutex<Vec<JoinHandle<StorageResult<()>>>>,
}

impl DiskTileStore {
    /// Open (or create) a store at `root`.
    ///
    /// Scans existing tiles to initialise the stored byte count.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        for dir in [TILES_DIR, STAGING_DIR, REGIONS_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|source| StorageError::Io { path, source })?;
        }

        let total = scan_tiles(&root.join(TILES_DIR))?;
        debug!(root = %root.display(), total_bytes = total, "Opened disk tile store");

        Ok(Self {
            root,
            total_bytes: Arc::new(AtomicU64::new(total)),
            queued_bytes: Arc::new(AtomicU64::new(0)),
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Committed region manifests, sorted by id.
    pub fn list_regions(&self) -> StorageResult<Vec<RegionManifest>> {
        let dir = self.root.join(REGIONS_DIR);
        let entries = fs::read_dir(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut manifests = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| StorageError::Io {
                    path: dir.clone(),
                    source,
                })?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            manifests.push(read_manifest(&path)?);
        }
        manifests.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(manifests)
    }

    fn tile_path(&self, url: &str) -> PathBuf {
        self.root.join(TILES_DIR).join(url_key(url))
    }

    fn manifest_path(&self, region_id: &str) -> PathBuf {
        self.root
            .join(REGIONS_DIR)
            .join(format!("{}.json", sanitize_region_id(region_id)))
    }

    fn write_batch_blocking(
        root: &Path,
        tiles: &[Tile],
        total_bytes: &AtomicU64,
    ) -> StorageResult<()> {
        let tiles_dir = root.join(TILES_DIR);
        let staging_dir = root.join(STAGING_DIR);
        let mut staged = Vec::with_capacity(tiles.len());

        // Write every payload to its own temp file first, then move the
        // whole batch into place.
        for tile in tiles {
            let key = url_key(&tile.url);
            let final_path = tiles_dir.join(&key);
            if final_path.exists() {
                continue;
            }
            let io_err = |source| StorageError::Io {
                path: tiles_dir.clone(),
                source,
            };
            let mut temp = tempfile::Builder::new()
                .prefix(&key)
                .suffix(TEMP_SUFFIX)
                .tempfile_in(&tiles_dir)
                .map_err(io_err)?;
            temp.write_all(&tile.data).map_err(io_err)?;
            staged.push((key, temp, final_path, tile.size_bytes()));
        }

        for (key, temp, final_path, size) in staged {
            // Another writer may have placed the same tile meanwhile
            match temp.persist_noclobber(&final_path) {
                Ok(_) => {}
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(StorageError::Io {
                        path: final_path,
                        source: e.error,
                    });
                }
            }
            let marker = staging_dir.join(&key);
            fs::write(&marker, b"").map_err(|source| StorageError::Io {
                path: marker.clone(),
                source,
            })?;
            total_bytes.fetch_add(size, Ordering::SeqCst);
        }

        Ok(())
    }
}

impl TileStore for DiskTileStore {
    fn bulk_lookup<'a>(
        &'a self,
        urls: &'a [String],
    ) -> BoxFuture<'a, StorageResult<Vec<Option<Tile>>>> {
        Box::pin(async move {
            let mut results = Vec::with_capacity(urls.len());
            for url in urls {
                let path = self.tile_path(url);
                match tokio::fs::read(&path).await {
                    Ok(data) => results.push(Some(Tile::new(url.clone(), data))),
                    Err(e) if e.kind() == ErrorKind::NotFound => results.push(None),
                    Err(source) => return Err(StorageError::Io { path, source }),
                }
            }
            Ok(results)
        })
    }

    /// Written bytes plus bytes of batches still on the blocking pool.
    ///
    /// A queued tile that turns out to exist already is counted until its
    /// batch finishes, so this may briefly over-report but never under-reports.
    fn current_total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst) + self.queued_bytes.load(Ordering::SeqCst)
    }

    fn queue_batch_write(&self, tiles: Vec<Tile>) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let root = self.root.clone();
            let total_bytes = Arc::clone(&self.total_bytes);
            let queued_bytes = Arc::clone(&self.queued_bytes);
            let count = tiles.len();
            let batch_bytes: u64 = tiles.iter().map(Tile::size_bytes).sum();
            queued_bytes.fetch_add(batch_bytes, Ordering::SeqCst);

            let handle = tokio::task::spawn_blocking(move || {
                let result = Self::write_batch_blocking(&root, &tiles, &total_bytes);
                queued_bytes.fetch_sub(batch_bytes, Ordering::SeqCst);
                result
            });
            self.pending.lock().push(handle);

            debug!(tiles = count, "Queued batch write");
            Ok(())
        })
    }

    fn flush(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let handles: Vec<_> = std::mem::take(&mut *self.pending.lock());
            let mut first_error = None;

            for joined in join_all(handles).await {
                let outcome = match joined {
                    Ok(result) => result,
                    Err(e) => Err(StorageError::WriteTask(e.to_string())),
                };
                if let Err(e) = outcome {
                    warn!(error = %e, "Batch write failed");
                    first_error.get_or_insert(e);
                }
            }

            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    fn commit_region<'a>(&'a self, region: &'a Region) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let mut total = 0u64;
            for url in region.urls() {
                let path = self.tile_path(url);
                match tokio::fs::metadata(&path).await {
                    Ok(meta) => total += meta.len(),
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        warn!(region = region.id(), url = %url, "Commit rejected: tile missing");
                        return Ok(false);
                    }
                    Err(source) => return Err(StorageError::Io { path, source }),
                }
            }

            let manifest = RegionManifest {
                id: region.id().to_string(),
                urls: region.urls().to_vec(),
                total_bytes: total,
                committed_at: Utc::now(),
            };
            let json =
                serde_json::to_vec_pretty(&manifest).map_err(|e| StorageError::Manifest {
                    region: region.id().to_string(),
                    reason: e.to_string(),
                })?;

            let path = self.manifest_path(region.id());
            let temp_path = path.with_extension(format!("json{}", TEMP_SUFFIX));
            tokio::fs::write(&temp_path, json)
                .await
                .map_err(|source| StorageError::Io {
                    path: temp_path.clone(),
                    source,
                })?;
            tokio::fs::rename(&temp_path, &path)
                .await
                .map_err(|source| StorageError::Io {
                    path: path.clone(),
                    source,
                })?;

            let staging_dir = self.root.join(STAGING_DIR);
            for url in region.urls() {
                let marker = staging_dir.join(url_key(url));
                if let Err(e) = tokio::fs::remove_file(&marker).await {
                    if e.kind() != ErrorKind::NotFound {
                        warn!(path = %marker.display(), error = %e, "Failed to clear staging marker");
                    }
                }
            }

            Ok(true)
        })
    }

    fn cleanup_temporary(&self, purge_unlinked: bool) -> BoxFuture<'_, StorageResult<CleanupStats>> {
        let root = self.root.clone();
        let total_bytes = Arc::clone(&self.total_bytes);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                cleanup_blocking(&root, purge_unlinked, &total_bytes)
            })
            .await
            .map_err(|e| StorageError::WriteTask(e.to_string()))?
        })
    }
}

fn cleanup_blocking(
    root: &Path,
    purge_unlinked: bool,
    total_bytes: &AtomicU64,
) -> StorageResult<CleanupStats> {
    let mut stats = CleanupStats::default();

    let staging_dir = root.join(STAGING_DIR);
    for path in list_files(&staging_dir)? {
        fs::remove_file(&path).map_err(|source| StorageError::Io { path, source })?;
        stats.staging_cleared += 1;
    }

    let tiles_dir = root.join(TILES_DIR);
    // Interrupted writes leave temp files behind
    for path in list_files(&tiles_dir)? {
        if path.to_string_lossy().ends_with(TEMP_SUFFIX) {
            fs::remove_file(&path).map_err(|source| StorageError::Io { path, source })?;
        }
    }

    if purge_unlinked {
        let mut linked = HashSet::new();
        for path in list_files(&root.join(REGIONS_DIR))? {
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let manifest = read_manifest(&path)?;
                linked.extend(manifest.urls.iter().map(|u| url_key(u)));
            }
        }

        for path in list_files(&tiles_dir)? {
            let key = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if linked.contains(&key) {
                continue;
            }
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&path).map_err(|source| StorageError::Io { path, source })?;
            stats.tiles_purged += 1;
            stats.bytes_freed += size;
        }
        let freed = stats.bytes_freed;
        let _ = total_bytes.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
            Some(t.saturating_sub(freed))
        });
    }

    Ok(stats)
}

fn list_files(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|source| StorageError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| StorageError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

fn scan_tiles(dir: &Path) -> StorageResult<u64> {
    let mut total = 0;
    for path in list_files(dir)? {
        if path.to_string_lossy().ends_with(TEMP_SUFFIX) {
            continue;
        }
        total += fs::metadata(&path)
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?
            .len();
    }
    Ok(total)
}

fn read_manifest(path: &Path) -> StorageResult<RegionManifest> {
    let bytes = fs::read(path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|e| StorageError::Manifest {
        region: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Hex SHA-256 of a URL, used as its file name.
fn url_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn sanitize_region_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tile(url: &str, size: usize) -> Tile {
        Tile::new(url, vec![7u8; size])
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_url_key_is_stable_hex() {
        let key = url_key("http://tiles/1/2/3.png");
        assert_eq!(key.len(), 64);
        assert_eq!(key, url_key("http://tiles/1/2/3.png"));
        assert_ne!(key, url_key("http://tiles/1/2/4.png"));
    }

    #[test]
    fn test_sanitize_region_id() {
        assert_eq!(sanitize_region_id("alps/east 1"), "alps_east_1");
        assert_eq!(sanitize_region_id("na-west_2"), "na-west_2");
    }

    #[tokio::test]
    async fn test_write_flush_lookup() {
        let dir = TempDir::new().unwrap();
        let store = DiskTileStore::open(dir.path()).unwrap();

        store
            .queue_batch_write(vec![tile("http://a", 100), tile("http://b", 50)])
            .await
            .unwrap();
        store.flush().await.unwrap();

        let query = urls(&["http://b", "http://missing", "http://a"]);
        let found = store.bulk_lookup(&query).await.unwrap();

        assert_eq!(found[0].as_ref().unwrap().size_bytes(), 50);
        assert!(found[1].is_none());
        assert_eq!(found[2].as_ref().unwrap().size_bytes(), 100);
        assert_eq!(store.current_total_bytes(), 150);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_tile_in_concurrent_batches_is_stored_once() {
        let dir = TempDir::new().unwrap();
        let store = DiskTileStore::open(dir.path()).unwrap();

        for _ in 0..8 {
            store
                .queue_batch_write(vec![tile("http://shared", 64), tile("http://other", 1)])
                .await
                .unwrap();
        }
        store.flush().await.unwrap();

        assert_eq!(store.current_total_bytes(), 65);
        let leftovers: Vec<_> = list_files(&dir.path().join(TILES_DIR))
            .unwrap()
            .into_iter()
            .filter(|p| p.to_string_lossy().ends_with(TEMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());

        let region = Region::new("r", urls(&["http://shared", "http://other"]));
        assert!(store.commit_region(&region).await.unwrap());
    }

    #[tokio::test]
    async fn test_queued_batch_counts_toward_total() {
        let dir = TempDir::new().unwrap();
        let store = DiskTileStore::open(dir.path()).unwrap();

        store
            .queue_batch_write(vec![tile("http://a", 500)])
            .await
            .unwrap();

        assert!(store.current_total_bytes() >= 500);
        store.flush().await.unwrap();
        assert_eq!(store.current_total_bytes(), 500);
    }

    #[tokio::test]
    async fn test_reopen_recovers_total_bytes() {
        let dir = TempDir::new().unwrap();
        {
            let store = DiskTileStore::open(dir.path()).unwrap();
            store
                .queue_batch_write(vec![tile("http://a", 300)])
                .await
                .unwrap();
            store.flush().await.unwrap();
        }

        let store = DiskTileStore::open(dir.path()).unwrap();
        assert_eq!(store.current_total_bytes(), 300);
    }

    #[tokio::test]
    async fn test_commit_writes_manifest_and_clears_staging() {
        let dir = TempDir::new().unwrap();
        let store = DiskTileStore::open(dir.path()).unwrap();
        store
            .queue_batch_write(vec![tile("http://a", 10), tile("http://b", 20)])
            .await
            .unwrap();
        store.flush().await.unwrap();

        let region = Region::new("alps", urls(&["http://a", "http://b"]));
        assert!(store.commit_region(&region).await.unwrap());

        let regions = store.list_regions().unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].id, "alps");
        assert_eq!(regions[0].total_bytes, 30);
        assert!(list_files(&dir.path().join(STAGING_DIR)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_missing_tile_returns_false() {
        let dir = TempDir::new().unwrap();
        let store = DiskTileStore::open(dir.path()).unwrap();

        let region = Region::new("alps", urls(&["http://never-written"]));

        assert!(!store.commit_region(&region).await.unwrap());
        assert!(store.list_regions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_purges_only_unlinked() {
        let dir = TempDir::new().unwrap();
        let store = DiskTileStore::open(dir.path()).unwrap();
        store
            .queue_batch_write(vec![tile("http://a", 10), tile("http://b", 20)])
            .await
            .unwrap();
        store.flush().await.unwrap();
        store
            .commit_region(&Region::new("alps", urls(&["http://a"])))
            .await
            .unwrap();

        let stats = store.cleanup_temporary(true).await.unwrap();

        assert_eq!(stats.staging_cleared, 1);
        assert_eq!(stats.tiles_purged, 1);
        assert_eq!(stats.bytes_freed, 20);
        assert_eq!(store.current_total_bytes(), 10);

        let query = urls(&["http://a", "http://b"]);
        let found = store.bulk_lookup(&query).await.unwrap();
        assert!(found[0].is_some());
        assert!(found[1].is_none());
    }

    #[tokio::test]
    async fn test_cleanup_without_purge_retains_tiles() {
        let dir = TempDir::new().unwrap();
        let store = DiskTileStore::open(dir.path()).unwrap();
        store
            .queue_batch_write(vec![tile("http://a", 10)])
            .await
            .unwrap();
        store.flush().await.unwrap();

        let stats = store.cleanup_temporary(false).await.unwrap();

        assert_eq!(stats.staging_cleared, 1);
        assert_eq!(stats.tiles_purged, 0);
        assert_eq!(store.current_total_bytes(), 10);
    }
}
