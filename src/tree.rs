// # Entry Index - Ordered Map, LRU List, Refcounts
//
// One `SwapTree` per registered swap area: an ordered map from swap
// offset to entry, an intrusive LRU threaded through the entry slots,
// and the single lock that protects both plus the refcount of every
// entry in the area.
//
// ## Refcount discipline
//
// An entry is born with refcount 1 (the index's own reference) and is
// pinned (+1) by any operation that works on its payload with the lock
// dropped. An entry may be freed exactly when, under the lock, its
// refcount has reached zero or below and it is no longer in the map.
// The writeback epilogue drops two references at once on success, so a
// raced invalidate can drive the count to -1; the count is signed and
// both 0 and -1 mean "free now".
//
// The slot vector recycles indices through a free list, in the style of
// a vector-backed intrusive linked list: `lru_prev`/`lru_next` are slot
// indices, and neighbor pointers are copied out before relinking to keep
// the borrow checker out of the way.

use crate::pool::blob::{BlobHandle, BlobPool};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;

/// Index of an entry slot within its tree. Only meaningful under the
/// tree lock.
pub(crate) type EntryId = usize;

/// Metadata for one compressed page.
#[derive(Debug)]
pub(crate) struct Entry {
    pub offset: u64,
    pub handle: BlobHandle,
    pub length: usize,
    refcount: i32,
    lru_prev: Option<EntryId>,
    lru_next: Option<EntryId>,
    on_lru: bool,
}

impl Entry {
    pub fn new(offset: u64, handle: BlobHandle, length: usize) -> Self {
        Self {
            offset,
            handle,
            length,
            refcount: 1,
            lru_prev: None,
            lru_next: None,
            on_lru: false,
        }
    }
}

/// Map, LRU and slots; every field is guarded by the owning tree's lock.
#[derive(Debug, Default)]
pub(crate) struct TreeInner {
    map: BTreeMap<u64, EntryId>,
    slots: Vec<Option<Entry>>,
    free_slots: Vec<EntryId>,
    lru_head: Option<EntryId>,
    lru_tail: Option<EntryId>,
}

impl TreeInner {
    fn ent(&self, id: EntryId) -> &Entry {
        self.slots[id].as_ref().expect("entry slot is live")
    }

    fn ent_mut(&mut self, id: EntryId) -> &mut Entry {
        self.slots[id].as_mut().expect("entry slot is live")
    }

    pub fn lookup(&self, offset: u64) -> Option<EntryId> {
        self.map.get(&offset).copied()
    }

    /// Install a fresh entry. When an entry already exists at the same
    /// offset, the new entry is handed back together with the incumbent's
    /// id and nothing is replaced.
    pub fn insert(&mut self, entry: Entry) -> Result<EntryId, (Entry, EntryId)> {
        if let Some(&dup) = self.map.get(&entry.offset) {
            return Err((entry, dup));
        }
        let offset = entry.offset;
        let id = match self.free_slots.pop() {
            Some(id) => {
                self.slots[id] = Some(entry);
                id
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.map.insert(offset, id);
        Ok(id)
    }

    /// Remove the entry from the map. The record itself stays alive for
    /// whoever still holds a reference.
    pub fn erase(&mut self, id: EntryId) {
        let offset = self.ent(id).offset;
        let removed = self.map.remove(&offset);
        debug_assert_eq!(removed, Some(id));
    }

    pub fn get(&mut self, id: EntryId) {
        self.ent_mut(id).refcount += 1;
    }

    /// Drop one reference; returns the post-decrement count. Never frees.
    #[must_use]
    pub fn put(&mut self, id: EntryId) -> i32 {
        let entry = self.ent_mut(id);
        entry.refcount -= 1;
        entry.refcount
    }

    /// Detach the record for freeing. The caller must have observed a
    /// non-positive refcount and the entry must be out of the map.
    pub fn take(&mut self, id: EntryId) -> Entry {
        let entry = self.slots[id].take().expect("entry slot is live");
        debug_assert!(entry.refcount <= 0);
        debug_assert!(!entry.on_lru);
        debug_assert_ne!(self.map.get(&entry.offset), Some(&id));
        self.free_slots.push(id);
        entry
    }

    pub fn handle_and_length(&self, id: EntryId) -> (BlobHandle, usize) {
        let entry = self.ent(id);
        (entry.handle, entry.length)
    }

    pub fn offset(&self, id: EntryId) -> u64 {
        self.ent(id).offset
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    // ------------------------------------------------------------------
    // LRU
    // ------------------------------------------------------------------

    pub fn lru_push_tail(&mut self, id: EntryId) {
        debug_assert!(!self.ent(id).on_lru);
        let old_tail = self.lru_tail;
        {
            let entry = self.ent_mut(id);
            entry.lru_prev = old_tail;
            entry.lru_next = None;
            entry.on_lru = true;
        }
        match old_tail {
            Some(tail) => self.ent_mut(tail).lru_next = Some(id),
            None => self.lru_head = Some(id),
        }
        self.lru_tail = Some(id);
    }

    pub fn lru_push_head(&mut self, id: EntryId) {
        debug_assert!(!self.ent(id).on_lru);
        let old_head = self.lru_head;
        {
            let entry = self.ent_mut(id);
            entry.lru_next = old_head;
            entry.lru_prev = None;
            entry.on_lru = true;
        }
        match old_head {
            Some(head) => self.ent_mut(head).lru_prev = Some(id),
            None => self.lru_tail = Some(id),
        }
        self.lru_head = Some(id);
    }

    /// Unlink from the LRU. No-op for already-detached entries.
    pub fn lru_remove(&mut self, id: EntryId) {
        if !self.ent(id).on_lru {
            return;
        }
        // Copy the neighbors first to avoid aliasing the slot borrows.
        let (prev, next) = {
            let entry = self.ent_mut(id);
            let links = (entry.lru_prev, entry.lru_next);
            entry.lru_prev = None;
            entry.lru_next = None;
            entry.on_lru = false;
            links
        };
        match prev {
            Some(p) => self.ent_mut(p).lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.ent_mut(n).lru_prev = prev,
            None => self.lru_tail = prev,
        }
    }

    /// Detach and return the least-recently-used entry, if any.
    pub fn lru_pop_head(&mut self) -> Option<EntryId> {
        let head = self.lru_head?;
        self.lru_remove(head);
        Some(head)
    }

    #[cfg(test)]
    pub fn lru_order(&self) -> Vec<u64> {
        let mut order = Vec::new();
        let mut cursor = self.lru_head;
        while let Some(id) = cursor {
            order.push(self.ent(id).offset);
            cursor = self.ent(id).lru_next;
        }
        order
    }

    // ------------------------------------------------------------------
    // Purge
    // ------------------------------------------------------------------

    /// Tear down the whole index, returning every record still in the
    /// map so the caller can release the handles. Outstanding entry ids
    /// are invalidated; the area is expected to be quiesced.
    pub fn purge(&mut self) -> Vec<Entry> {
        let ids: Vec<EntryId> = self.map.values().copied().collect();
        self.map.clear();
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut entry) = self.slots[id].take() {
                entry.on_lru = false;
                entry.lru_prev = None;
                entry.lru_next = None;
                entries.push(entry);
            }
        }
        self.slots.clear();
        self.free_slots.clear();
        self.lru_head = None;
        self.lru_tail = None;
        entries
    }
}

/// One swap area: its blob pool and the locked index state.
pub(crate) struct SwapTree {
    swap_type: u32,
    pub(crate) pool: BlobPool,
    inner: Mutex<TreeInner>,
}

impl SwapTree {
    pub fn new(swap_type: u32, pool: BlobPool) -> Self {
        Self {
            swap_type,
            pool,
            inner: Mutex::new(TreeInner::default()),
        }
    }

    #[inline]
    pub fn swap_type(&self) -> u32 {
        self.swap_type
    }

    /// The area lock. Held only for short non-blocking regions; codec
    /// and allocator calls run with it dropped and the entry pinned.
    pub fn lock(&self) -> MutexGuard<'_, TreeInner> {
        self.inner.lock()
    }
}
