// # Scratch Page Ring
//
// A fixed ring of compound (two-page) frames. The store path takes one
// to carry a compressed payload out of its per-CPU buffer before it
// blocks on writeback; an empty ring turns into a tmppage-fail store
// rejection. The ring size doubles as a bound on how many stores can be
// blocked in the fallback at once.

use crate::codec::DST_BUFFER_SIZE;
use parking_lot::Mutex;

/// Number of compound frames in the ring.
pub const SCRATCH_RING_FRAMES: usize = 16;

/// One compound frame, large enough to hold any per-CPU payload.
pub struct ScratchFrame {
    data: Box<[u8]>,
}

impl ScratchFrame {
    fn new() -> Self {
        Self {
            data: vec![0u8; DST_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// The ring itself. Frames are allocated once at initialization and
/// recycled for the lifetime of the cache.
pub struct ScratchRing {
    frames: Mutex<Vec<ScratchFrame>>,
}

impl ScratchRing {
    pub fn new() -> Self {
        let frames = (0..SCRATCH_RING_FRAMES)
            .map(|_| ScratchFrame::new())
            .collect::<Vec<_>>();
        Self {
            frames: Mutex::new(frames),
        }
    }

    /// Take a frame, or `None` when every frame is out staging a store.
    pub fn take(&self) -> Option<ScratchFrame> {
        self.frames.lock().pop()
    }

    /// Return a frame to the ring.
    pub fn give(&self, frame: ScratchFrame) {
        self.frames.lock().push(frame);
    }
}

impl Default for ScratchRing {
    fn default() -> Self {
        Self::new()
    }
}
