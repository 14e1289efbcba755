// # Configuration
//
// Boot-time configuration plus the two live tunables (pool ceiling and
// admission ratio). Boot-time fields are read once while assembling the
// cache; live tunables may be changed at runtime through [`Tunables`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Cache configuration, read at initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Master switch. A disabled cache refuses to initialize; the VM then
    /// swaps directly to the device.
    pub enabled: bool,

    /// Compressor name, `"lz4"` or `"deflate"`. Unknown names fall back
    /// to the default with a warning.
    pub compressor: String,

    /// Live: upper bound on the compressed pool, as a percentage of
    /// total RAM.
    pub max_pool_percent: u32,

    /// Live: reject a page when `compressed * 100 / page_size` exceeds
    /// this value.
    pub max_compression_ratio: u32,

    /// Override for total RAM in bytes. `None` queries the OS. Tests set
    /// this to get a deterministic pool ceiling.
    pub total_ram_bytes: Option<u64>,

    /// Number of per-CPU codec slots. `None` uses the detected CPU count.
    pub cpu_slots: Option<usize>,

    /// Capacity of the swap-area table.
    pub max_swap_areas: usize,

    /// Whether a nonempty area purge is a panic (invariant violation) or
    /// a warning (best-effort cleanup).
    pub panic_on_nonempty_purge: bool,
}

pub const DEFAULT_COMPRESSOR: &str = "lz4";
pub const DEFAULT_MAX_POOL_PERCENT: u32 = 50;
pub const DEFAULT_MAX_COMPRESSION_RATIO: u32 = 80;
pub const DEFAULT_MAX_SWAP_AREAS: usize = 32;

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compressor: DEFAULT_COMPRESSOR.to_string(),
            max_pool_percent: DEFAULT_MAX_POOL_PERCENT,
            max_compression_ratio: DEFAULT_MAX_COMPRESSION_RATIO,
            total_ram_bytes: None,
            cpu_slots: None,
            max_swap_areas: DEFAULT_MAX_SWAP_AREAS,
            panic_on_nonempty_purge: false,
        }
    }
}

/// The live tunables, shared between the cache and its operator surface.
///
/// Reads use relaxed ordering; a store admitted under a stale ceiling is
/// acceptable, matching the advisory nature of both knobs.
#[derive(Debug)]
pub struct Tunables {
    max_pool_percent: AtomicU32,
    max_compression_ratio: AtomicU32,
}

impl Tunables {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            max_pool_percent: AtomicU32::new(config.max_pool_percent),
            max_compression_ratio: AtomicU32::new(config.max_compression_ratio),
        }
    }

    #[inline]
    pub fn max_pool_percent(&self) -> u32 {
        self.max_pool_percent.load(Ordering::Relaxed)
    }

    pub fn set_max_pool_percent(&self, percent: u32) {
        self.max_pool_percent.store(percent, Ordering::Relaxed);
    }

    #[inline]
    pub fn max_compression_ratio(&self) -> u32 {
        self.max_compression_ratio.load(Ordering::Relaxed)
    }

    pub fn set_max_compression_ratio(&self, ratio: u32) {
        self.max_compression_ratio.store(ratio, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.compressor, "lz4");
        assert_eq!(config.max_pool_percent, 50);
        assert_eq!(config.max_compression_ratio, 80);
        assert_eq!(config.max_swap_areas, 32);
        assert!(!config.panic_on_nonempty_purge);
    }

    #[test]
    fn test_live_tunables() {
        let tunables = Tunables::new(&CacheConfig::default());
        assert_eq!(tunables.max_pool_percent(), 50);
        tunables.set_max_pool_percent(20);
        assert_eq!(tunables.max_pool_percent(), 20);

        assert_eq!(tunables.max_compression_ratio(), 80);
        tunables.set_max_compression_ratio(95);
        assert_eq!(tunables.max_compression_ratio(), 95);
    }
}
