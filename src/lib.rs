// Swapcache - Compressed Swap Page Cache
//
// Takes anonymous pages on their way to the swap device, compresses them
// and keeps them in a RAM pool instead. Pages come back through the load
// hook; under pool pressure the least-recently-stored entries are
// written back to the real device through the swap-cache collaborator.

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod frontswap;
pub mod page;
pub mod pool;
pub mod stats;
mod tree;

pub use backend::{MemSwapDevice, SwapBackend, SwapCacheSlot, SwapEntry, WritebackCompletion};
pub use cache::SwapCache;
pub use codec::CompressorKind;
pub use config::{CacheConfig, Tunables};
pub use error::{CacheError, LoadError, Result, StoreError, WritebackError};
pub use frontswap::{Frontswap, FrontswapOps};
pub use page::{PageBuffer, SwapCachePage, PAGE_SIZE};
pub use stats::StatsSnapshot;
