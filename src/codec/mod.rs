// # Codec Registry - Per-CPU Compression Contexts
//
// One compressor context and one destination scratch buffer per CPU slot.
// The caller acquires its CPU's context, compresses into the slot's
// scratch buffer, and must keep the slot held until the result has been
// copied out (into a pool allocation or a staging frame). Holding the
// slot guard is the userspace equivalent of running with preemption
// disabled on that CPU.

pub mod algorithms;

use crate::page::PAGE_SIZE;
use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{info, warn};

/// Size of each per-CPU destination buffer. Twice the page size so a
/// compression attempt that expands its input still has room to finish
/// and be rejected by the admission check rather than by the codec.
pub const DST_BUFFER_SIZE: usize = 2 * PAGE_SIZE;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("buffer too small: need {required} bytes, have {available}")]
    BufferTooSmall { required: usize, available: usize },
}

/// A block compressor/decompressor context.
///
/// Contexts may carry internal stream state (the deflate codec does), so
/// both operations take `&mut self` and a context is never shared across
/// CPU slots.
pub trait Codec: Send {
    fn name(&self) -> &'static str;

    /// Compress `src` into `dst`, returning the compressed length.
    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError>;

    /// Decompress `src` into `dst`, returning the decompressed length.
    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError>;
}

/// Compressor selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressorKind {
    #[default]
    Lz4,
    Deflate,
}

impl CompressorKind {
    /// Resolve a configured compressor name. Returns `None` for names
    /// this build does not provide.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "lz4" => Some(CompressorKind::Lz4),
            "deflate" => Some(CompressorKind::Deflate),
            _ => None,
        }
    }
}

impl fmt::Display for CompressorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressorKind::Lz4 => write!(f, "lz4"),
            CompressorKind::Deflate => write!(f, "deflate"),
        }
    }
}

// ============================================================================
// Per-CPU Contexts
// ============================================================================

/// A single CPU slot: codec context plus destination scratch buffer.
pub struct CpuContext {
    codec: Box<dyn Codec>,
    dstmem: Box<[u8]>,
}

impl CpuContext {
    fn new(kind: CompressorKind) -> Self {
        Self {
            codec: algorithms::new_codec(kind),
            dstmem: vec![0u8; DST_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    /// Compress a page into this slot's scratch buffer, returning the
    /// compressed length. The payload stays valid while the slot guard
    /// is held.
    pub fn compress_page(&mut self, src: &[u8]) -> Result<usize, CodecError> {
        let Self { codec, dstmem } = self;
        codec.compress(src, dstmem)
    }

    /// The first `len` bytes of the scratch buffer.
    #[inline]
    pub fn payload(&self, len: usize) -> &[u8] {
        &self.dstmem[..len]
    }

    pub fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        self.codec.decompress(src, dst)
    }
}

/// Guard over a CPU slot. While held, no other thread can enter this
/// slot and the scratch buffer contents are stable.
pub type CpuSlotGuard<'a> = MutexGuard<'a, CpuContext>;

thread_local! {
    // Which slot this thread was assigned on first use.
    static THREAD_SLOT: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// The registry of per-CPU codec contexts.
pub struct CodecRegistry {
    slots: Vec<Mutex<CpuContext>>,
    kind: CompressorKind,
    next_slot: AtomicUsize,
}

impl CodecRegistry {
    /// Build contexts for `cpu_slots` CPUs using the named compressor,
    /// falling back to the default when the name is unknown.
    pub fn new(requested: &str, cpu_slots: usize) -> Self {
        let kind = CompressorKind::from_name(requested).unwrap_or_else(|| {
            let fallback = CompressorKind::default();
            warn!(requested, %fallback, "compressor not available, using fallback");
            fallback
        });
        let slots = (0..cpu_slots.max(1))
            .map(|_| Mutex::new(CpuContext::new(kind)))
            .collect::<Vec<_>>();
        info!(compressor = %kind, cpus = slots.len(), "codec registry ready");
        Self {
            slots,
            kind,
            next_slot: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn kind(&self) -> CompressorKind {
        self.kind
    }

    #[inline]
    pub fn cpu_slots(&self) -> usize {
        self.slots.len()
    }

    fn current_slot(&self) -> usize {
        THREAD_SLOT.with(|slot| {
            let mut assigned = slot.get();
            if assigned == usize::MAX {
                assigned = self.next_slot.fetch_add(1, Ordering::Relaxed);
                slot.set(assigned);
            }
            assigned % self.slots.len()
        })
    }

    /// Acquire the calling thread's CPU slot.
    ///
    /// Lock ordering: a CPU slot is always taken before any blob mapping
    /// and never while holding an area lock.
    pub fn get_cpu(&self) -> CpuSlotGuard<'_> {
        self.slots[self.current_slot()].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressor_names() {
        assert_eq!(CompressorKind::from_name("lz4"), Some(CompressorKind::Lz4));
        assert_eq!(
            CompressorKind::from_name("deflate"),
            Some(CompressorKind::Deflate)
        );
        assert_eq!(CompressorKind::from_name("lzo"), None);
    }

    #[test]
    fn test_unknown_compressor_falls_back() {
        let registry = CodecRegistry::new("lzo", 2);
        assert_eq!(registry.kind(), CompressorKind::Lz4);
        assert_eq!(registry.cpu_slots(), 2);
    }

    #[test]
    fn test_slot_compress_round_trip() {
        let registry = CodecRegistry::new("lz4", 1);
        let src = [0x42u8; PAGE_SIZE];

        let mut cpu = registry.get_cpu();
        let dlen = cpu.compress_page(&src).unwrap();
        assert!(dlen > 0);
        assert!(dlen < PAGE_SIZE);

        let payload = cpu.payload(dlen).to_vec();
        let mut out = [0u8; PAGE_SIZE];
        let n = cpu.decompress(&payload, &mut out).unwrap();
        assert_eq!(n, PAGE_SIZE);
        assert_eq!(out, src);
    }

    #[test]
    fn test_zero_slots_is_clamped() {
        let registry = CodecRegistry::new("lz4", 0);
        assert_eq!(registry.cpu_slots(), 1);
        let _cpu = registry.get_cpu();
    }
}
