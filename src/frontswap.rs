// # Frontswap Hooks - Inbound Interface
//
// The hook set the VM calls into. The cache implements [`FrontswapOps`];
// [`Frontswap`] is the registration point that hands the hook set to the
// paging code. Registration happens once, after the cache has fully
// initialized.

use crate::error::{LoadError, StoreError};
use crate::page::PageBuffer;
use std::sync::Arc;

/// The five operations the VM drives the cache with.
pub trait FrontswapOps: Send + Sync {
    /// Register a new swap area. Called in atomic context from swapon;
    /// must not block.
    fn init(&self, swap_type: u32);

    /// Try to admit a page being swapped out.
    fn store(&self, swap_type: u32, offset: u64, page: &PageBuffer) -> Result<(), StoreError>;

    /// Fill `page` from the cache.
    fn load(&self, swap_type: u32, offset: u64, page: &mut PageBuffer) -> Result<(), LoadError>;

    /// Drop a single slot; the VM has freed it.
    fn invalidate_page(&self, swap_type: u32, offset: u64);

    /// Drop every slot of an area; the VM is turning it off.
    fn invalidate_area(&self, swap_type: u32);
}

/// A registered hook set.
pub struct Frontswap {
    ops: Arc<dyn FrontswapOps>,
}

impl Frontswap {
    pub fn register(ops: Arc<dyn FrontswapOps>) -> Self {
        Self { ops }
    }

    pub fn init(&self, swap_type: u32) {
        self.ops.init(swap_type);
    }

    pub fn store(
        &self,
        swap_type: u32,
        offset: u64,
        page: &PageBuffer,
    ) -> Result<(), StoreError> {
        self.ops.store(swap_type, offset, page)
    }

    pub fn load(
        &self,
        swap_type: u32,
        offset: u64,
        page: &mut PageBuffer,
    ) -> Result<(), LoadError> {
        self.ops.load(swap_type, offset, page)
    }

    pub fn invalidate_page(&self, swap_type: u32, offset: u64) {
        self.ops.invalidate_page(swap_type, offset);
    }

    pub fn invalidate_area(&self, swap_type: u32) {
        self.ops.invalidate_area(swap_type);
    }
}
