// # Page Buffers and Swap-Cache Pages
//
// `PageBuffer` is the unit of exchange with the VM: a page-aligned 4 KiB
// byte buffer. `SwapCachePage` models the page the swap-cache collaborator
// hands back during writeback: a buffer plus the lock/uptodate/reclaim
// state bits the writeback path manipulates.

use crate::backend::SwapEntry;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, Ordering};

/// Page size of the cached units (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Page-aligned buffer holding one uncompressed page.
///
/// `#[repr(C, align(4096))]` keeps the buffer compatible with direct-I/O
/// style consumers that require page alignment.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageBuffer {
    data: [u8; PAGE_SIZE],
}

impl PageBuffer {
    /// Create a new zeroed page buffer.
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
        }
    }

    /// Create a page buffer from existing bytes, zero-padded to a page.
    #[inline]
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut buffer = Self::new();
        buffer.data[..data.len()].copy_from_slice(data);
        buffer
    }

    /// Create a page buffer filled with a single byte value.
    #[inline]
    pub fn filled(byte: u8) -> Self {
        Self {
            data: [byte; PAGE_SIZE],
        }
    }

    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero out the entire page.
    #[inline]
    pub fn zero(&mut self) {
        self.data.fill(0);
    }

    pub fn copy_from(&mut self, other: &PageBuffer) {
        self.data.copy_from_slice(&other.data);
    }
}

impl Default for PageBuffer {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for PageBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.data[..] == other.data[..]
    }
}

impl Eq for PageBuffer {}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PageBuffer({} bytes)", PAGE_SIZE)
    }
}

// ============================================================================
// Swap-Cache Page
// ============================================================================

/// A page owned by the swap-cache collaborator.
///
/// Returned by `get_swap_cache_page` in one of two states:
///
/// - *new*: locked and uninitialized; the writeback path fills it,
///   marks it up-to-date and submits it for I/O.
/// - *exist*: unlocked and already populated; the writeback path must
///   not touch it.
///
/// The state bits are atomics so collaborators can observe them without
/// taking the data lock.
pub struct SwapCachePage {
    entry: SwapEntry,
    data: RwLock<PageBuffer>,
    locked: AtomicBool,
    uptodate: AtomicBool,
    reclaim: AtomicBool,
}

impl SwapCachePage {
    /// Create a locked, uninitialized page for the given swap slot.
    pub fn new_locked(entry: SwapEntry) -> Self {
        Self {
            entry,
            data: RwLock::new(PageBuffer::new()),
            locked: AtomicBool::new(true),
            uptodate: AtomicBool::new(false),
            reclaim: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn entry(&self) -> SwapEntry {
        self.entry
    }

    pub fn data(&self) -> RwLockReadGuard<'_, PageBuffer> {
        self.data.read()
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, PageBuffer> {
        self.data.write()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_uptodate(&self) -> bool {
        self.uptodate.load(Ordering::Acquire)
    }

    pub fn set_uptodate(&self) {
        self.uptodate.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_reclaim(&self) -> bool {
        self.reclaim.load(Ordering::Acquire)
    }

    /// Mark the page for reclaim after its I/O completes. Idempotent.
    pub fn set_reclaim(&self) {
        self.reclaim.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for SwapCachePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapCachePage")
            .field("entry", &self.entry)
            .field("locked", &self.is_locked())
            .field("uptodate", &self.is_uptodate())
            .field("reclaim", &self.is_reclaim())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_buffer_round_trip() {
        let mut buffer = PageBuffer::filled(0x41);
        assert!(buffer.data().iter().all(|&b| b == 0x41));

        buffer.zero();
        assert!(buffer.data().iter().all(|&b| b == 0));

        let other = PageBuffer::from_bytes(&[1, 2, 3]);
        buffer.copy_from(&other);
        assert_eq!(&buffer.data()[..4], &[1, 2, 3, 0]);
        assert_eq!(buffer, other);
    }

    #[test]
    fn test_swap_cache_page_state_bits() {
        let page = SwapCachePage::new_locked(SwapEntry::new(0, 0x10));
        assert!(page.is_locked());
        assert!(!page.is_uptodate());
        assert!(!page.is_reclaim());

        page.data_mut().data_mut()[0] = 0xAB;
        page.set_uptodate();
        page.set_reclaim();
        page.set_reclaim();
        page.unlock();

        assert!(!page.is_locked());
        assert!(page.is_uptodate());
        assert!(page.is_reclaim());
        assert_eq!(page.data().data()[0], 0xAB);
    }
}
