// # Cache Statistics
//
// Operator-visible counters for the compressed pool. The three gauges
// (pool pages, stored pages, outstanding writebacks) are decremented as
// resources are released; the event counters only ever grow. All updates
// use relaxed ordering; the counters are informational and a reader may
// observe a slightly stale value.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Live counters, shared across every component of the cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Frames currently charged to the compressed pool.
    pub(crate) pool_pages: AtomicU64,

    /// Compressed pages currently resident.
    pub(crate) stored_pages: AtomicU64,

    /// Submitted but not yet completed device writes. Signed: the
    /// completion hook may run before the submitter's increment lands.
    pub(crate) outstanding_writebacks: AtomicI64,

    /// Frame allocations refused by the pool ceiling.
    pub(crate) pool_limit_hit: AtomicU64,

    /// Pages fully written back to the swap device.
    pub(crate) written_back_pages: AtomicU64,

    /// Stores rejected by the admission ratio.
    pub(crate) reject_compress_poor: AtomicU64,

    /// Stores that entered the writeback fallback.
    pub(crate) writeback_attempted: AtomicU64,

    /// Fallbacks abandoned because the scratch ring was empty.
    pub(crate) reject_tmppage_fail: AtomicU64,

    /// Fallbacks abandoned because the retry allocation failed too.
    pub(crate) reject_alloc_fail: AtomicU64,

    /// Stores that succeeded only thanks to the writeback fallback.
    pub(crate) saved_by_writeback: AtomicU64,

    /// Stores that displaced an existing entry at the same offset.
    pub(crate) duplicate_entry: AtomicU64,
}

impl CacheStats {
    #[inline]
    pub(crate) fn count(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read-only snapshot of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pool_pages: self.pool_pages.load(Ordering::Relaxed),
            stored_pages: self.stored_pages.load(Ordering::Relaxed),
            outstanding_writebacks: self.outstanding_writebacks.load(Ordering::Relaxed),
            pool_limit_hit: self.pool_limit_hit.load(Ordering::Relaxed),
            written_back_pages: self.written_back_pages.load(Ordering::Relaxed),
            reject_compress_poor: self.reject_compress_poor.load(Ordering::Relaxed),
            writeback_attempted: self.writeback_attempted.load(Ordering::Relaxed),
            reject_tmppage_fail: self.reject_tmppage_fail.load(Ordering::Relaxed),
            reject_alloc_fail: self.reject_alloc_fail.load(Ordering::Relaxed),
            saved_by_writeback: self.saved_by_writeback.load(Ordering::Relaxed),
            duplicate_entry: self.duplicate_entry.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`CacheStats`], suitable for serialization into
/// an operator endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub pool_pages: u64,
    pub stored_pages: u64,
    pub outstanding_writebacks: i64,
    pub pool_limit_hit: u64,
    pub written_back_pages: u64,
    pub reject_compress_poor: u64,
    pub writeback_attempted: u64,
    pub reject_tmppage_fail: u64,
    pub reject_alloc_fail: u64,
    pub saved_by_writeback: u64,
    pub duplicate_entry: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = CacheStats::default();
        CacheStats::count(&stats.duplicate_entry);
        CacheStats::count(&stats.duplicate_entry);
        stats.pool_pages.fetch_add(7, Ordering::Relaxed);
        stats.outstanding_writebacks.fetch_sub(1, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.duplicate_entry, 2);
        assert_eq!(snap.pool_pages, 7);
        assert_eq!(snap.outstanding_writebacks, -1);
        assert_eq!(snap.stored_pages, 0);
    }
}
