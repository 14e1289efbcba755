// # Packed-Blob Allocator
//
// Handle-based storage for compressed payloads. Callers allocate a blob
// of the exact compressed size, copy bytes in through a write mapping,
// and later read them back through a read mapping. Each swap area owns
// one pool; all pools charge the shared [`FramePool`] budget.
//
// Mappings are scoped closures rather than guards, which keeps the
// handle type `Copy` and the pool free of self-referential lifetimes.
// Lock ordering: a blob lock is only ever taken after the caller's CPU
// slot (if any). The store's duplicate replacement and the area purge
// release handles while still holding the area lock; that is safe
// because no path acquires the area lock while holding a blob lock.

use super::FramePool;
use crate::page::PAGE_SIZE;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque token for one stored byte sequence.
///
/// Handles are plain values; ownership discipline lives in the entry
/// index, which stores exactly one handle per entry and frees it exactly
/// once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobHandle(u64);

/// A packed-blob pool for one swap area.
#[derive(Debug)]
pub struct BlobPool {
    frames: Arc<FramePool>,
    slots: DashMap<u64, Arc<RwLock<Box<[u8]>>>>,
    next_id: AtomicU64,
}

impl BlobPool {
    pub fn new(frames: Arc<FramePool>) -> Self {
        Self {
            frames,
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a blob of `size` bytes, charging whole frames against
    /// the global budget. `None` means the pool ceiling was hit.
    pub fn alloc(&self, size: usize) -> Option<BlobHandle> {
        debug_assert!(size > 0);
        if !self.frames.alloc_frames(size.div_ceil(PAGE_SIZE)) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let storage = vec![0u8; size].into_boxed_slice();
        self.slots.insert(id, Arc::new(RwLock::new(storage)));
        Some(BlobHandle(id))
    }

    /// Release a blob and return its frames to the budget.
    pub fn free(&self, handle: BlobHandle) {
        let (_, blob) = self
            .slots
            .remove(&handle.0)
            .expect("freed blob handle maps a live allocation");
        self.frames.free_frames(blob.read().len().div_ceil(PAGE_SIZE));
    }

    /// Map the blob read-only for the duration of `f`.
    pub fn with_read<R>(&self, handle: BlobHandle, f: impl FnOnce(&[u8]) -> R) -> R {
        let blob = self.lookup(handle);
        let bytes = blob.read();
        f(&bytes)
    }

    /// Map the blob writable for the duration of `f`.
    pub fn with_write<R>(&self, handle: BlobHandle, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let blob = self.lookup(handle);
        let mut bytes = blob.write();
        f(&mut bytes)
    }

    fn lookup(&self, handle: BlobHandle) -> Arc<RwLock<Box<[u8]>>> {
        // Clone out of the shard so the shard lock is not held across
        // the caller's mapping.
        self.slots
            .get(&handle.0)
            .map(|slot| Arc::clone(slot.value()))
            .expect("mapped blob handle maps a live allocation")
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
