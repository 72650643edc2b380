//! Tile storage.
//!
//! The fetch engine consumes storage through the [`TileStore`] trait:
//!
//! ```text
//! TileStore (trait)
//!     ├── MemoryTileStore  (in-process, tests and dry runs)
//!     └── DiskTileStore    (files + JSON region manifests)
//! ```

mod disk;
mod memory;
mod traits;

pub use disk::{DiskTileStore, RegionManifest};
pub use memory::{BatchRecord, MemoryTileStore};
pub use traits::{BoxFuture, CleanupStats, StorageError, StorageResult, TileStore};
