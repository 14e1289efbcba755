// # Swap Cache - Store, Load, Invalidate, Writeback
//
// The top-level object tying the codec registry, frame budget, scratch
// ring, per-area trees and the swap backend together. All state is
// assembled here at initialization; components hold references rather
// than consulting globals.
//
// Lock ordering across the whole crate: CPU slot, then blob mapping.
// Codec and mapping work runs with the area lock dropped; the lock is
// held while releasing a displaced handle (duplicate store, purge),
// which no path inverts.

use crate::backend::{SwapBackend, SwapCacheSlot, SwapEntry, WritebackCompletion};
use crate::codec::{CodecRegistry, CpuSlotGuard};
use crate::config::{CacheConfig, Tunables};
use crate::error::{CacheError, LoadError, StoreError, WritebackError};
use crate::frontswap::FrontswapOps;
use crate::page::{PageBuffer, PAGE_SIZE};
use crate::pool::blob::{BlobHandle, BlobPool};
use crate::pool::scratch::{ScratchFrame, ScratchRing};
use crate::pool::FramePool;
use crate::stats::{CacheStats, StatsSnapshot};
use crate::tree::{Entry, SwapTree};
use once_cell::sync::OnceCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Ceiling on submitted-but-incomplete device writes. Keeps the engine
/// from decompressing an unbounded number of entries into the swap
/// cache at once.
const MAX_OUTSTANDING_WRITEBACKS: i64 = 64;

/// How many LRU entries one pressured store may evict.
const STORE_WRITEBACK_BATCH: usize = 16;

/// Where the compressed bytes of an in-flight store currently live.
enum Payload<'a> {
    /// Still in the per-CPU buffer; the slot stays held.
    PerCpu(CpuSlotGuard<'a>),

    /// Staged into a scratch frame so the CPU slot could be released
    /// before blocking.
    Staged(ScratchFrame),
}

/// The compressed swap cache.
pub struct SwapCache {
    tunables: Arc<Tunables>,
    stats: Arc<CacheStats>,
    codecs: CodecRegistry,
    frames: Arc<FramePool>,
    scratch: ScratchRing,
    backend: Arc<dyn SwapBackend>,
    trees: Box<[OnceCell<SwapTree>]>,
    panic_on_nonempty_purge: bool,
}

impl SwapCache {
    /// Assemble a cache from configuration and a swap backend.
    pub fn new(config: CacheConfig, backend: Arc<dyn SwapBackend>) -> Result<Self, CacheError> {
        if !config.enabled {
            return Err(CacheError::Disabled);
        }
        if config.max_swap_areas == 0 {
            return Err(CacheError::Configuration(
                "max_swap_areas must be at least 1".to_string(),
            ));
        }

        let tunables = Arc::new(Tunables::new(&config));
        let stats = Arc::new(CacheStats::default());
        let codecs = CodecRegistry::new(
            &config.compressor,
            config.cpu_slots.unwrap_or_else(num_cpus::get),
        );
        let frames = Arc::new(FramePool::new(
            &config,
            Arc::clone(&tunables),
            Arc::clone(&stats),
        )?);
        let trees = (0..config.max_swap_areas)
            .map(|_| OnceCell::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        info!(
            compressor = %codecs.kind(),
            max_swap_areas = trees.len(),
            "compressed swap cache ready"
        );
        Ok(Self {
            tunables,
            stats,
            codecs,
            frames,
            scratch: ScratchRing::new(),
            backend,
            trees,
            panic_on_nonempty_purge: config.panic_on_nonempty_purge,
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    fn tree(&self, swap_type: u32) -> Option<&SwapTree> {
        self.trees.get(swap_type as usize).and_then(OnceCell::get)
    }

    // ------------------------------------------------------------------
    // Area registration
    // ------------------------------------------------------------------

    /// Register a swap area. Non-blocking: callable from atomic context.
    pub fn init_area(&self, swap_type: u32) {
        let Some(slot) = self.trees.get(swap_type as usize) else {
            error!(swap_type, "swap type beyond the area table, not cached");
            return;
        };
        let tree = SwapTree::new(swap_type, BlobPool::new(Arc::clone(&self.frames)));
        if slot.set(tree).is_err() {
            warn!(swap_type, "swap area initialized twice");
        }
    }

    // ------------------------------------------------------------------
    // Store
    // ------------------------------------------------------------------

    /// Compress and admit one page.
    pub fn store(
        &self,
        swap_type: u32,
        offset: u64,
        page: &PageBuffer,
    ) -> Result<(), StoreError> {
        let tree = self.tree(swap_type).ok_or(StoreError::NoDevice)?;

        let mut cpu = self.codecs.get_cpu();
        let dlen = match cpu.compress_page(page.data()) {
            Ok(dlen) => dlen,
            Err(_) => return Err(StoreError::BadInput),
        };

        if dlen * 100 / PAGE_SIZE > self.tunables.max_compression_ratio() as usize {
            CacheStats::count(&self.stats.reject_compress_poor);
            return Err(StoreError::CompressionTooPoor);
        }

        let (handle, payload) = match tree.pool.alloc(dlen) {
            Some(handle) => (handle, Payload::PerCpu(cpu)),
            None => {
                CacheStats::count(&self.stats.writeback_attempted);
                // Stage the payload out of the per-CPU buffer so the
                // slot can be released before blocking on writeback.
                let Some(mut frame) = self.scratch.take() else {
                    CacheStats::count(&self.stats.reject_tmppage_fail);
                    return Err(StoreError::TempPageFail);
                };
                frame.bytes_mut()[..dlen].copy_from_slice(cpu.payload(dlen));
                drop(cpu);

                self.writeback_entries(tree, STORE_WRITEBACK_BATCH);
                match tree.pool.alloc(dlen) {
                    Some(handle) => {
                        CacheStats::count(&self.stats.saved_by_writeback);
                        (handle, Payload::Staged(frame))
                    }
                    None => {
                        self.scratch.give(frame);
                        CacheStats::count(&self.stats.reject_alloc_fail);
                        return Err(StoreError::AllocFail);
                    }
                }
            }
        };

        tree.pool.with_write(handle, |dst| {
            let src = match &payload {
                Payload::PerCpu(cpu) => cpu.payload(dlen),
                Payload::Staged(frame) => &frame.bytes()[..dlen],
            };
            dst[..dlen].copy_from_slice(src);
        });
        match payload {
            Payload::PerCpu(cpu) => drop(cpu),
            Payload::Staged(frame) => self.scratch.give(frame),
        }

        let mut entry = Entry::new(offset, handle, dlen);
        let mut guard = tree.lock();
        let id = loop {
            match guard.insert(entry) {
                Ok(id) => break id,
                Err((fresh, dup)) => {
                    // Replace the incumbent. Holding the lock across the
                    // retry means the second insert cannot collide again.
                    CacheStats::count(&self.stats.duplicate_entry);
                    guard.erase(dup);
                    guard.lru_remove(dup);
                    if guard.put(dup) == 0 {
                        let old = guard.take(dup);
                        tree.pool.free(old.handle);
                        self.stats.stored_pages.fetch_sub(1, Ordering::Relaxed);
                    }
                    entry = fresh;
                }
            }
        };
        guard.lru_push_tail(id);
        drop(guard);

        self.stats.stored_pages.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------

    /// Decompress the entry at `offset` into `page`.
    pub fn load(
        &self,
        swap_type: u32,
        offset: u64,
        page: &mut PageBuffer,
    ) -> Result<(), LoadError> {
        let tree = self.tree(swap_type).ok_or(LoadError::NotFound)?;

        let (id, handle, length) = {
            let mut guard = tree.lock();
            let id = guard.lookup(offset).ok_or(LoadError::NotFound)?;
            guard.get(id);
            // Off the LRU while we decompress, so the writeback engine
            // cannot pick a page that is being faulted back in.
            guard.lru_remove(id);
            let (handle, length) = guard.handle_and_length(id);
            (id, handle, length)
        };

        let mut cpu = self.codecs.get_cpu();
        let result = tree
            .pool
            .with_read(handle, |src| cpu.decompress(&src[..length], page.data_mut()));
        drop(cpu);
        let n = result.unwrap_or_else(|e| panic!("resident entry failed to decompress: {e}"));
        assert_eq!(n, PAGE_SIZE, "resident entry decompressed to {n} bytes");

        let mut guard = tree.lock();
        if guard.put(id) != 0 {
            // Re-queue at the MRU end, but only while the entry is
            // still indexed; after a concurrent invalidate the last
            // reference holder frees it instead.
            if guard.lookup(offset) == Some(id) {
                guard.lru_remove(id);
                guard.lru_push_tail(id);
            }
            return Ok(());
        }
        // Invalidated or written back while we decompressed; ours was
        // the last reference, and whoever erased it left the freeing to
        // us.
        guard.lru_remove(id);
        let entry = guard.take(id);
        drop(guard);
        tree.pool.free(entry.handle);
        self.stats.stored_pages.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Invalidate
    // ------------------------------------------------------------------

    /// The VM freed one swap slot; drop its entry if present.
    pub fn invalidate_page(&self, swap_type: u32, offset: u64) {
        let Some(tree) = self.tree(swap_type) else {
            return;
        };
        let mut guard = tree.lock();
        let Some(id) = guard.lookup(offset) else {
            return;
        };
        guard.erase(id);
        guard.lru_remove(id);
        if guard.put(id) != 0 {
            // A load or writeback still owns the record and frees it
            // when it finishes.
            return;
        }
        let entry = guard.take(id);
        drop(guard);
        tree.pool.free(entry.handle);
        self.stats.stored_pages.fetch_sub(1, Ordering::Relaxed);
    }

    /// The VM turned an area off; drop everything it still holds.
    ///
    /// Best-effort backstop: the VM is expected to have unused every
    /// slot first, so a nonempty purge is reported (or escalated, per
    /// configuration).
    pub fn invalidate_area(&self, swap_type: u32) {
        let Some(tree) = self.tree(swap_type) else {
            return;
        };
        let mut guard = tree.lock();
        if !guard.is_empty() {
            if self.panic_on_nonempty_purge {
                panic!("swap area {swap_type} purged while entries remain");
            }
            warn!(swap_type, "purging a nonempty swap area");
        }
        let entries = guard.purge();
        for entry in &entries {
            tree.pool.free(entry.handle);
        }
        drop(guard);
        self.stats
            .stored_pages
            .fetch_sub(entries.len() as u64, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Writeback
    // ------------------------------------------------------------------

    /// Evict up to `max_entries` LRU entries of an area to the swap
    /// device. Returns how many entries were actually freed.
    pub fn writeback(&self, swap_type: u32, max_entries: usize) -> usize {
        match self.tree(swap_type) {
            Some(tree) => self.writeback_entries(tree, max_entries),
            None => 0,
        }
    }

    fn writeback_entries(&self, tree: &SwapTree, nr: usize) -> usize {
        let mut freed = 0;
        for _ in 0..nr {
            if self.stats.outstanding_writebacks.load(Ordering::Relaxed)
                > MAX_OUTSTANDING_WRITEBACKS
            {
                break;
            }

            let mut guard = tree.lock();
            let Some(id) = guard.lru_pop_head() else {
                break;
            };
            // Pin so a concurrent invalidate cannot free the record
            // while we work on it unlocked.
            guard.get(id);
            let offset = guard.offset(id);
            let (handle, length) = guard.handle_and_length(id);
            drop(guard);

            let result = self.writeback_entry(tree, offset, handle, length);

            let mut guard = tree.lock();
            // Drop our pin; on success also the creation reference, now
            // that the page is on its way to the device.
            let mut refcount = guard.put(id);
            if result.is_ok() {
                refcount = guard.put(id);
            }
            // Failure leaves the entry resident: refcount 2 means a
            // load is in flight and re-queues it; refcount 1 means no
            // load, so requeue at the head, the cheapest retry
            // position. Success retires the entry from the index and
            // the LRU immediately, even while a raced load still pins
            // the record: the page is durable, and whoever drops the
            // last reference frees the record and handle. Negative
            // counts mean an invalidate raced and already erased the
            // entry. The in-map checks cover entries a raced
            // invalidate erased or a completed load re-queued.
            let mapped = guard.lookup(offset) == Some(id);
            if result.is_ok() {
                guard.lru_remove(id);
                if mapped {
                    guard.erase(id);
                }
            } else if refcount == 1 && mapped {
                guard.lru_remove(id);
                guard.lru_push_head(id);
            }
            let entry = (refcount <= 0).then(|| {
                guard.lru_remove(id);
                guard.take(id)
            });
            drop(guard);

            if let Some(entry) = entry {
                tree.pool.free(entry.handle);
                self.stats.stored_pages.fetch_sub(1, Ordering::Relaxed);
                freed += 1;
            }
        }
        debug!(swap_type = tree.swap_type(), freed, "writeback pass done");
        freed
    }

    /// Resume the intercepted swap-out of one entry: materialize its
    /// swap-cache page, decompress into it, and hand it to the block
    /// layer.
    fn writeback_entry(
        &self,
        tree: &SwapTree,
        offset: u64,
        handle: BlobHandle,
        length: usize,
    ) -> Result<(), WritebackError> {
        let slot = SwapEntry::new(tree.swap_type(), offset);
        let page = match self.backend.get_swap_cache_page(slot) {
            SwapCacheSlot::NoMem => return Err(WritebackError::OutOfMemory),
            SwapCacheSlot::Exist(_) => return Err(WritebackError::AlreadyPresent),
            SwapCacheSlot::New(page) => page,
        };

        {
            let mut cpu = self.codecs.get_cpu();
            let mut dst = page.data_mut();
            let result = tree
                .pool
                .with_read(handle, |src| cpu.decompress(&src[..length], dst.data_mut()));
            let n =
                result.unwrap_or_else(|e| panic!("entry under writeback failed to decompress: {e}"));
            assert_eq!(n, PAGE_SIZE, "entry under writeback decompressed to {n} bytes");
        }
        page.set_uptodate();
        // Let the VM reclaim the swap-cache page as soon as the write
        // completes.
        page.set_reclaim();

        let stats = Arc::clone(&self.stats);
        let completion: WritebackCompletion = Box::new(move |_result| {
            stats.outstanding_writebacks.fetch_sub(1, Ordering::Relaxed);
            CacheStats::count(&stats.written_back_pages);
        });
        if self.backend.writepage(page, completion).is_ok() {
            self.stats
                .outstanding_writebacks
                .fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl FrontswapOps for SwapCache {
    fn init(&self, swap_type: u32) {
        self.init_area(swap_type);
    }

    fn store(&self, swap_type: u32, offset: u64, page: &PageBuffer) -> Result<(), StoreError> {
        SwapCache::store(self, swap_type, offset, page)
    }

    fn load(&self, swap_type: u32, offset: u64, page: &mut PageBuffer) -> Result<(), LoadError> {
        SwapCache::load(self, swap_type, offset, page)
    }

    fn invalidate_page(&self, swap_type: u32, offset: u64) {
        SwapCache::invalidate_page(self, swap_type, offset);
    }

    fn invalidate_area(&self, swap_type: u32) {
        SwapCache::invalidate_area(self, swap_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemSwapDevice;

    fn test_cache(total_frames: u64, percent: u32) -> (SwapCache, Arc<MemSwapDevice>) {
        let device = Arc::new(MemSwapDevice::new());
        let config = CacheConfig {
            total_ram_bytes: Some(total_frames * PAGE_SIZE as u64),
            max_pool_percent: percent,
            cpu_slots: Some(2),
            ..CacheConfig::default()
        };
        let cache = SwapCache::new(config, Arc::clone(&device) as Arc<dyn SwapBackend>).unwrap();
        cache.init_area(0);
        (cache, device)
    }

    #[test]
    fn test_disabled_cache_refuses_to_build() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let device = Arc::new(MemSwapDevice::new());
        assert!(matches!(
            SwapCache::new(config, device),
            Err(CacheError::Disabled)
        ));
    }

    #[test]
    fn test_store_without_area_is_nodevice() {
        let (cache, _) = test_cache(64, 100);
        let page = PageBuffer::filled(1);
        assert_eq!(
            cache.store(9, 0, &page).unwrap_err(),
            StoreError::NoDevice
        );
        assert_eq!(
            cache.load(9, 0, &mut PageBuffer::new()).unwrap_err(),
            LoadError::NotFound
        );
    }

    #[test]
    fn test_resident_entries_respect_admission_ratio() {
        let (cache, _) = test_cache(64, 100);
        let ratio = cache.tunables().max_compression_ratio() as usize;
        for offset in 0..8u64 {
            let page = PageBuffer::filled(offset as u8);
            cache.store(0, offset, &page).unwrap();
        }

        let tree = cache.tree(0).unwrap();
        let guard = tree.lock();
        for offset in 0..8u64 {
            let id = guard.lookup(offset).unwrap();
            let (_, length) = guard.handle_and_length(id);
            assert!(length * 100 / PAGE_SIZE <= ratio);
        }
    }

    #[test]
    fn test_in_flight_cap_stops_the_engine() {
        let (cache, _) = test_cache(64, 100);
        for offset in 0..3u64 {
            cache.store(0, offset, &PageBuffer::filled(7)).unwrap();
        }

        cache
            .stats
            .outstanding_writebacks
            .store(MAX_OUTSTANDING_WRITEBACKS + 1, Ordering::Relaxed);
        assert_eq!(cache.writeback(0, 3), 0);
        assert_eq!(cache.stats().stored_pages, 3);

        cache.stats.outstanding_writebacks.store(0, Ordering::Relaxed);
        assert_eq!(cache.writeback(0, 3), 3);
        assert_eq!(cache.stats().stored_pages, 0);
    }

    #[test]
    fn test_writeback_success_reaches_the_device() {
        let (cache, device) = test_cache(64, 100);
        let page = PageBuffer::filled(0x5C);
        cache.store(0, 0x33, &page).unwrap();

        assert_eq!(cache.writeback(0, 4), 1);
        assert_eq!(
            cache.load(0, 0x33, &mut PageBuffer::new()).unwrap_err(),
            LoadError::NotFound
        );
        assert_eq!(device.written(SwapEntry::new(0, 0x33)).unwrap(), page);

        let snap = cache.stats();
        assert_eq!(snap.written_back_pages, 1);
        assert_eq!(snap.outstanding_writebacks, 0);
        assert_eq!(snap.stored_pages, 0);
        assert_eq!(snap.pool_pages, 0);
    }

    #[test]
    fn test_successful_writeback_with_a_load_pin_retires_the_entry() {
        let (cache, device) = test_cache(64, 100);
        let page = PageBuffer::filled(0x66);
        cache.store(0, 0x44, &page).unwrap();
        let tree = cache.tree(0).unwrap();

        // Pin the entry the way a load does before it drops the lock
        // to decompress; the entry is still on the LRU when the engine
        // selects it, and the pin is still held when the engine's
        // epilogue runs.
        let id = {
            let mut guard = tree.lock();
            let id = guard.lookup(0x44).unwrap();
            guard.get(id);
            id
        };

        // The writeback succeeds but cannot free the pinned record.
        // The entry must nevertheless leave the index: its page is
        // already durable on the device.
        assert_eq!(cache.writeback(0, 1), 0);
        assert_eq!(device.written(SwapEntry::new(0, 0x44)).unwrap(), page);
        assert_eq!(
            cache.load(0, 0x44, &mut PageBuffer::new()).unwrap_err(),
            LoadError::NotFound
        );

        // A second pass must not harvest the orphaned record.
        assert_eq!(cache.writeback(0, 1), 0);
        assert_eq!(cache.stats().written_back_pages, 1);

        // The pin holder drops the last reference and frees the
        // orphan, exactly as the load epilogue does.
        let mut guard = tree.lock();
        assert_eq!(guard.lookup(0x44), None);
        assert_eq!(guard.put(id), 0);
        guard.lru_remove(id);
        let entry = guard.take(id);
        drop(guard);
        tree.pool.free(entry.handle);
        cache.stats.stored_pages.fetch_sub(1, Ordering::Relaxed);

        let snap = cache.stats();
        assert_eq!(snap.stored_pages, 0);
        assert_eq!(snap.pool_pages, 0);
    }

    #[test]
    fn test_writeback_already_present_requeues_the_entry() {
        let (cache, device) = test_cache(64, 100);
        let page = PageBuffer::filled(0x21);
        cache.store(0, 5, &page).unwrap();
        device.seed_swap_cache_page(SwapEntry::new(0, 5));

        assert_eq!(cache.writeback(0, 1), 0);
        assert_eq!(device.written_count(), 0);

        // The entry survived and is still loadable.
        let mut out = PageBuffer::new();
        cache.load(0, 5, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn test_writeback_nomem_requeues_the_entry() {
        let (cache, device) = test_cache(64, 100);
        cache.store(0, 6, &PageBuffer::filled(0x22)).unwrap();
        device.set_fail_page_alloc(true);

        assert_eq!(cache.writeback(0, 1), 0);
        assert_eq!(cache.stats().stored_pages, 1);

        device.set_fail_page_alloc(false);
        assert_eq!(cache.writeback(0, 1), 1);
    }

    #[test]
    fn test_failed_writeback_requeues_at_the_head() {
        let (cache, device) = test_cache(64, 100);
        cache.store(0, 1, &PageBuffer::filled(1)).unwrap();
        cache.store(0, 2, &PageBuffer::filled(2)).unwrap();

        // An unwritable LRU head goes back to the head after each failed
        // attempt, so the whole pass stalls on it.
        device.seed_swap_cache_page(SwapEntry::new(0, 1));
        assert_eq!(cache.writeback(0, 2), 0);
        assert_eq!(device.written_count(), 0);

        // Once the head entry is gone the rest of the queue drains.
        cache.invalidate_page(0, 1);
        assert_eq!(cache.writeback(0, 2), 1);
        assert!(device.written(SwapEntry::new(0, 2)).is_some());
    }
}
