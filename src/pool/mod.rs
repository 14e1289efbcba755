// # Memory Pools
//
// Three layers of backing storage for compressed payloads:
//
// - `FramePool`: the global page-frame budget. Enforces the pool
//   ceiling, a live-tunable percentage of total RAM.
// - `BlobPool` (`blob.rs`): the packed-blob allocator handing out opaque
//   handles over variable-size allocations, charged against the frame
//   pool. One instance per swap area.
// - `ScratchRing` (`scratch.rs`): a fixed ring of compound frames for
//   staging a compressed payload out of a per-CPU buffer when the store
//   path has to block.

pub mod blob;
pub mod scratch;

use crate::config::{CacheConfig, Tunables};
use crate::error::CacheError;
use crate::page::PAGE_SIZE;
use crate::stats::CacheStats;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// The global frame budget backing every area's blob pool.
///
/// Frames are accounting units of one page each; the byte storage itself
/// lives inside the blob allocations. `alloc_frames` refuses once the
/// pool has reached its ceiling, and the refusal is what drives the
/// store path into its writeback fallback.
#[derive(Debug)]
pub struct FramePool {
    total_ram_pages: u64,
    tunables: Arc<Tunables>,
    stats: Arc<CacheStats>,
}

impl FramePool {
    pub fn new(
        config: &CacheConfig,
        tunables: Arc<Tunables>,
        stats: Arc<CacheStats>,
    ) -> Result<Self, CacheError> {
        let total_ram_bytes = match config.total_ram_bytes {
            Some(bytes) => bytes,
            None => {
                let info =
                    sys_info::mem_info().map_err(|e| CacheError::SystemInfo(e.to_string()))?;
                info.total * 1024
            }
        };
        Ok(Self {
            total_ram_pages: total_ram_bytes / PAGE_SIZE as u64,
            tunables,
            stats,
        })
    }

    /// Current ceiling in frames. Recomputed on every call so that a
    /// live change of `max_pool_percent` takes effect immediately.
    #[inline]
    pub fn max_pool_pages(&self) -> u64 {
        u64::from(self.tunables.max_pool_percent()) * self.total_ram_pages / 100
    }

    /// Charge `count` frames against the pool. Returns `false` (and
    /// counts a pool-limit hit) when the pool is already at its ceiling.
    pub fn alloc_frames(&self, count: usize) -> bool {
        if self.stats.pool_pages.load(Ordering::Relaxed) >= self.max_pool_pages() {
            CacheStats::count(&self.stats.pool_limit_hit);
            return false;
        }
        self.stats
            .pool_pages
            .fetch_add(count as u64, Ordering::Relaxed);
        true
    }

    pub fn free_frames(&self, count: usize) {
        self.stats
            .pool_pages
            .fetch_sub(count as u64, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn pool_pages(&self) -> u64 {
        self.stats.pool_pages.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_frames(total_frames: u64, percent: u32) -> FramePool {
        let config = CacheConfig {
            total_ram_bytes: Some(total_frames * PAGE_SIZE as u64),
            max_pool_percent: percent,
            ..CacheConfig::default()
        };
        let tunables = Arc::new(Tunables::new(&config));
        FramePool::new(&config, tunables, Arc::new(CacheStats::default())).unwrap()
    }

    #[test]
    fn test_ceiling_enforced() {
        let pool = pool_with_frames(8, 50);
        assert_eq!(pool.max_pool_pages(), 4);

        for _ in 0..4 {
            assert!(pool.alloc_frames(1));
        }
        assert!(!pool.alloc_frames(1));
        assert_eq!(pool.stats.pool_limit_hit.load(Ordering::Relaxed), 1);

        pool.free_frames(1);
        assert!(pool.alloc_frames(1));
        assert_eq!(pool.pool_pages(), 4);
    }

    #[test]
    fn test_live_percent_change_moves_ceiling() {
        let pool = pool_with_frames(100, 50);
        assert_eq!(pool.max_pool_pages(), 50);
        pool.tunables.set_max_pool_percent(10);
        assert_eq!(pool.max_pool_pages(), 10);
    }

    #[test]
    fn test_system_ram_discovery() {
        let config = CacheConfig::default();
        let tunables = Arc::new(Tunables::new(&config));
        let pool = FramePool::new(&config, tunables, Arc::new(CacheStats::default())).unwrap();
        assert!(pool.total_ram_pages > 0);
    }
}
