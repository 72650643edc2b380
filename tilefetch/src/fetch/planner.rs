//! Worker sizing and region partitioning.
//!
//! The worker count grows sub-linearly with the number of tiles:
//!
//! ```text
//! workers = clamp(floor((tiles + 1) ^ 0.375), 1, max_concurrent_workers)
//! ```
//!
//! The region is then cut into contiguous partitions of
//! `max(1, tiles / workers)` URLs. A trailing remainder partition, when
//! present, waits for a free worker slot.

use std::fmt;

use crate::config::FetchConfig;

/// Exponent of the default sizing curve.
pub const DEFAULT_SIZING_EXPONENT: f64 = 0.375;

/// Chooses how many workers a region of a given size gets.
pub trait SizingStrategy: Send + Sync {
    /// Worker count for `tile_count` tiles, at most `max_workers`.
    ///
    /// Implementations must return at least 1.
    fn worker_count(&self, tile_count: usize, max_workers: usize) -> usize;
}

/// Power-law sizing: `floor((n + 1) ^ exponent)`, clamped to `[1, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerLawSizing {
    pub exponent: f64,
}

impl Default for PowerLawSizing {
    fn default() -> Self {
        Self {
            exponent: DEFAULT_SIZING_EXPONENT,
        }
    }
}

impl SizingStrategy for PowerLawSizing {
    fn worker_count(&self, tile_count: usize, max_workers: usize) -> usize {
        let raw = ((tile_count as f64) + 1.0).powf(self.exponent).floor() as usize;
        raw.min(max_workers).max(1)
    }
}

/// Sizing strategy backed by a closure.
pub struct FnSizing<F>(F);

impl<F> FnSizing<F>
where
    F: Fn(usize, usize) -> usize + Send + Sync,
{
    /// Wrap `f(tile_count, max_workers)`. The result is clamped to `[1, max]`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> SizingStrategy for FnSizing<F>
where
    F: Fn(usize, usize) -> usize + Send + Sync,
{
    fn worker_count(&self, tile_count: usize, max_workers: usize) -> usize {
        (self.0)(tile_count, max_workers).clamp(1, max_workers.max(1))
    }
}

impl<F> fmt::Debug for FnSizing<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnSizing")
    }
}

/// How one region will be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    /// Tiles in the region.
    pub tile_count: usize,
    /// Concurrently running workers.
    pub worker_count: usize,
    /// URLs per partition (the last may be shorter).
    pub partition_size: usize,
    /// Number of partitions, each handled by one worker task.
    pub partition_count: usize,
    /// In-memory batch budget of each worker, in bytes.
    pub batch_heap_share: u64,
}

impl FetchPlan {
    /// Plan a region of `tile_count` tiles.
    pub fn compute(tile_count: usize, config: &FetchConfig, sizing: &dyn SizingStrategy) -> Self {
        let max_workers = config.max_concurrent_workers.max(1);
        let worker_count = sizing.worker_count(tile_count, max_workers).clamp(1, max_workers);
        let partition_size = (tile_count / worker_count).max(1);
        let partition_count = tile_count.div_ceil(partition_size);
        let batch_heap_share = config.max_batch_heap_bytes / worker_count as u64;

        Self {
            tile_count,
            worker_count,
            partition_size,
            partition_count,
            batch_heap_share,
        }
    }

    /// Split `urls` into this plan's contiguous partitions.
    pub fn partitions<'a>(&self, urls: &'a [String]) -> std::slice::Chunks<'a, String> {
        urls.chunks(self.partition_size)
    }
}

impl fmt::Display for FetchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tiles, {} workers, {} partitions of {}",
            self.tile_count, self.worker_count, self.partition_count, self.partition_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(max_workers: usize) -> FetchConfig {
        FetchConfig::default().with_max_concurrent_workers(max_workers)
    }

    fn urls(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("http://t/{}", i)).collect()
    }

    #[test]
    fn test_power_law_examples() {
        let sizing = PowerLawSizing::default();

        assert_eq!(sizing.worker_count(10, 4), 2);
        assert_eq!(sizing.worker_count(1000, 8), 8);
        assert_eq!(sizing.worker_count(0, 8), 1);
        assert_eq!(sizing.worker_count(1, 8), 1);
    }

    #[test]
    fn test_plan_ten_tiles_four_workers() {
        let plan = FetchPlan::compute(10, &config(4), &PowerLawSizing::default());

        assert_eq!(plan.worker_count, 2);
        assert_eq!(plan.partition_size, 5);
        assert_eq!(plan.partition_count, 2);
    }

    #[test]
    fn test_plan_with_remainder_partition() {
        let plan = FetchPlan::compute(7, &config(2), &FnSizing::new(|_, _| 2));
        let list = urls(7);
        let parts: Vec<_> = plan.partitions(&list).collect();

        assert_eq!(plan.partition_size, 3);
        assert_eq!(plan.partition_count, 3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 1);
    }

    #[test]
    fn test_plan_empty_region() {
        let plan = FetchPlan::compute(0, &config(8), &PowerLawSizing::default());

        assert_eq!(plan.worker_count, 1);
        assert_eq!(plan.partition_count, 0);
        assert_eq!(plan.partitions(&[]).count(), 0);
    }

    #[test]
    fn test_batch_share() {
        let cfg = config(4).with_max_batch_heap_bytes(1000);
        let plan = FetchPlan::compute(10, &cfg, &PowerLawSizing::default());

        assert_eq!(plan.batch_heap_share, 500);
    }

    #[test]
    fn test_fn_sizing_is_clamped() {
        assert_eq!(FnSizing::new(|_, _| 0).worker_count(10, 4), 1);
        assert_eq!(FnSizing::new(|_, _| 99).worker_count(10, 4), 4);
    }

    proptest! {
        #[test]
        fn prop_worker_count_within_bounds(n in 0usize..1_000_000, max in 1usize..64) {
            let w = PowerLawSizing::default().worker_count(n, max);
            prop_assert!(w >= 1);
            prop_assert!(w <= max);
        }

        #[test]
        fn prop_partitions_cover_region_in_order(n in 0usize..500, max in 1usize..16) {
            let plan = FetchPlan::compute(n, &config(max), &PowerLawSizing::default());
            let list = urls(n);
            let rejoined: Vec<String> = plan.partitions(&list).flatten().cloned().collect();

            prop_assert_eq!(rejoined, list);
            prop_assert_eq!(plan.partitions(&urls(n)).count(), plan.partition_count);
            prop_assert!(plan.partition_count <= plan.worker_count + 1 || n < plan.worker_count);
        }
    }
}
