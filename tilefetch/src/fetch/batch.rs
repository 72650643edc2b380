//! Per-worker in-memory write batch.

use crate::region::Tile;

/// Tiles fetched by one worker and not yet handed to storage.
///
/// The batch is full once its bytes reach the worker's budget. A zero budget
/// makes every tile a full batch.
#[derive(Debug)]
pub struct WriteBatch {
    tiles: Vec<Tile>,
    bytes: u64,
    budget: u64,
}

impl WriteBatch {
    pub fn new(budget: u64) -> Self {
        Self {
            tiles: Vec::new(),
            bytes: 0,
            budget,
        }
    }

    pub fn push(&mut self, tile: Tile) {
        self.bytes += tile.size_bytes();
        self.tiles.push(tile);
    }

    /// Bytes currently held.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn is_full(&self) -> bool {
        !self.tiles.is_empty() && self.bytes >= self.budget
    }

    /// Take the held tiles, leaving the batch empty.
    pub fn take(&mut self) -> Vec<Tile> {
        self.bytes = 0;
        std::mem::take(&mut self.tiles)
    }

    /// Drop the held tiles without writing them.
    pub fn discard(&mut self) -> usize {
        let dropped = self.tiles.len();
        self.take();
        dropped
    }
}
