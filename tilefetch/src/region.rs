//! Region and tile data types.
//!
//! A [`Region`] is a named, ordered list of tile URLs that are fetched and
//! committed together. A [`Tile`] is one fetched resource keyed by its URL.

use std::fmt;

use bytes::Bytes;

/// A named collection of tile addresses fetched and committed as one unit.
///
/// The URL list is immutable for the lifetime of a fetch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    id: String,
    urls: Vec<String>,
}

impl Region {
    /// Create a new region.
    ///
    /// # Arguments
    ///
    /// * `id` - Region identifier used when committing
    /// * `urls` - Tile addresses in fetch order
    pub fn new(id: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            id: id.into(),
            urls,
        }
    }

    /// Region identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tile addresses in fetch order.
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Number of tiles in the region.
    pub fn tile_count(&self) -> usize {
        self.urls.len()
    }

    /// Whether the region has no tiles.
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} tiles)", self.id, self.urls.len())
    }
}

/// One fetched resource, identified by its source URL.
///
/// Content is immutable once fetched: the same URL always yields the same
/// bytes, which is what makes deduplication against storage valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    /// Source URL.
    pub url: String,
    /// Payload bytes.
    pub data: Bytes,
}

impl Tile {
    /// Create a new tile.
    pub fn new(url: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            data: data.into(),
        }
    }

    /// Payload size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}
