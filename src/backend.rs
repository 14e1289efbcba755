// # Swap Backend - Swap Cache and Block I/O Collaborators
//
// The writeback path talks to the rest of the VM through two operations:
// materialize a swap-cache page for a slot, and submit a non-blocking
// write of that page to the device. `MemSwapDevice` is the in-memory
// reference implementation used by tests and embedders without a real
// swap layer.

use crate::page::{PageBuffer, SwapCachePage};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identifier of one slot on one swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapEntry {
    pub swap_type: u32,
    pub offset: u64,
}

impl SwapEntry {
    #[inline]
    pub fn new(swap_type: u32, offset: u64) -> Self {
        Self { swap_type, offset }
    }
}

/// Result of asking the swap cache for a page.
pub enum SwapCacheSlot {
    /// Freshly allocated, locked, uninitialized. The caller populates it
    /// and submits the write.
    New(Arc<SwapCachePage>),

    /// Already present and unlocked. The caller must not write it.
    Exist(Arc<SwapCachePage>),

    /// Page allocation failed.
    NoMem,
}

/// Completion hook for a submitted write. Runs exactly once, after the
/// device has consumed the page, with the I/O outcome.
pub type WritebackCompletion = Box<dyn FnOnce(std::io::Result<()>) + Send>;

/// The outbound interface to the swap-cache and block-I/O layers.
pub trait SwapBackend: Send + Sync {
    /// Find or create the swap-cache page for `entry`.
    fn get_swap_cache_page(&self, entry: SwapEntry) -> SwapCacheSlot;

    /// Submit a non-blocking write of `page` to the swap device. On
    /// `Ok` the completion will fire once the write finishes; on `Err`
    /// the completion is never invoked.
    fn writepage(
        &self,
        page: Arc<SwapCachePage>,
        completion: WritebackCompletion,
    ) -> std::io::Result<()>;
}

// ============================================================================
// In-Memory Swap Device
// ============================================================================

/// A swap cache plus device backed by maps.
///
/// Writes complete synchronously inside `writepage`, which keeps tests
/// deterministic. Pages marked for reclaim are dropped from the swap
/// cache once their write completes, mirroring how the VM reclaims a
/// clean swap-cache page after I/O.
#[derive(Default)]
pub struct MemSwapDevice {
    cache: DashMap<SwapEntry, Arc<SwapCachePage>>,
    device: Mutex<HashMap<SwapEntry, PageBuffer>>,
    fail_page_alloc: AtomicBool,
}

impl MemSwapDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent page allocations report `NoMem`.
    pub fn set_fail_page_alloc(&self, fail: bool) {
        self.fail_page_alloc.store(fail, Ordering::Relaxed);
    }

    /// Pre-populate the swap cache, as if the VM already had this slot
    /// resident. Returns the installed page.
    pub fn seed_swap_cache_page(&self, entry: SwapEntry) -> Arc<SwapCachePage> {
        let page = Arc::new(SwapCachePage::new_locked(entry));
        page.unlock();
        self.cache.insert(entry, Arc::clone(&page));
        page
    }

    /// Bytes most recently written to the device for `entry`.
    pub fn written(&self, entry: SwapEntry) -> Option<PageBuffer> {
        self.device.lock().get(&entry).cloned()
    }

    pub fn written_count(&self) -> usize {
        self.device.lock().len()
    }

    pub fn swap_cache_len(&self) -> usize {
        self.cache.len()
    }
}

impl SwapBackend for MemSwapDevice {
    fn get_swap_cache_page(&self, entry: SwapEntry) -> SwapCacheSlot {
        use dashmap::mapref::entry::Entry as MapEntry;
        match self.cache.entry(entry) {
            MapEntry::Occupied(occupied) => SwapCacheSlot::Exist(Arc::clone(occupied.get())),
            MapEntry::Vacant(vacant) => {
                if self.fail_page_alloc.load(Ordering::Relaxed) {
                    return SwapCacheSlot::NoMem;
                }
                let page = Arc::new(SwapCachePage::new_locked(entry));
                vacant.insert(Arc::clone(&page));
                SwapCacheSlot::New(page)
            }
        }
    }

    fn writepage(
        &self,
        page: Arc<SwapCachePage>,
        completion: WritebackCompletion,
    ) -> std::io::Result<()> {
        let entry = page.entry();
        let payload = PageBuffer::clone(&page.data());
        self.device.lock().insert(entry, payload);
        page.unlock();
        if page.is_reclaim() {
            self.cache.remove(&entry);
        }
        completion(Ok(()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_then_exist() {
        let device = MemSwapDevice::new();
        let entry = SwapEntry::new(0, 7);

        let page = match device.get_swap_cache_page(entry) {
            SwapCacheSlot::New(page) => page,
            _ => panic!("expected a fresh page"),
        };
        assert!(page.is_locked());

        match device.get_swap_cache_page(entry) {
            SwapCacheSlot::Exist(existing) => assert_eq!(existing.entry(), entry),
            _ => panic!("expected the cached page"),
        }
    }

    #[test]
    fn test_nomem_injection() {
        let device = MemSwapDevice::new();
        device.set_fail_page_alloc(true);
        assert!(matches!(
            device.get_swap_cache_page(SwapEntry::new(0, 1)),
            SwapCacheSlot::NoMem
        ));
    }

    #[test]
    fn test_writepage_completes_and_reclaims() {
        let device = MemSwapDevice::new();
        let entry = SwapEntry::new(1, 42);
        let page = match device.get_swap_cache_page(entry) {
            SwapCacheSlot::New(page) => page,
            _ => panic!("expected a fresh page"),
        };

        page.data_mut().data_mut()[..3].copy_from_slice(b"abc");
        page.set_uptodate();
        page.set_reclaim();

        let completed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&completed);
        device
            .writepage(
                page,
                Box::new(move |result| {
                    assert!(result.is_ok());
                    flag.store(true, Ordering::Relaxed);
                }),
            )
            .unwrap();

        assert!(completed.load(Ordering::Relaxed));
        assert_eq!(device.swap_cache_len(), 0);
        assert_eq!(&device.written(entry).unwrap().data()[..3], b"abc");
    }
}
