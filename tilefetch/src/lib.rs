//! TileFetch - region tile fetching with all-or-nothing commit
//!
//! Fetches the tiles of a region from a remote source, deduplicating against
//! what is already stored, and marks the region complete only if every tile
//! arrived within the storage quota.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tilefetch::{DiskTileStore, FetchConfig, Region, RegionFetcher, ReqwestTileClient};
//!
//! let store = Arc::new(DiskTileStore::open("/var/cache/tiles")?);
//! let client = Arc::new(ReqwestTileClient::new()?);
//! let fetcher = RegionFetcher::new(store, client, FetchConfig::default())?;
//!
//! let region = Region::new("hamburg", urls);
//! let outcome = fetcher.fetch(&region).await;
//! ```

pub mod config;
pub mod fetch;
pub mod logging;
pub mod provider;
pub mod region;
pub mod store;

pub use config::{ConfigError, ConfigFile, FetchConfig};
pub use fetch::{
    AbortNotification, AbortReason, CommitNotification, FetchError, FetchPlan, OperationState,
    Progress, RegionFetcher, RunOutcome,
};
pub use provider::{ReqwestTileClient, TileClient, TransportError};
pub use region::{Region, Tile};
pub use store::{DiskTileStore, MemoryTileStore, StorageError, TileStore};
