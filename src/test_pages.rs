//! Page allocator backed by the host heap, shared by the unit tests.

use alloc::alloc::{alloc_zeroed, dealloc};
use alloc::vec::Vec;
use core::alloc::Layout;

use kspin::SpinNoIrq;

use crate::{AllocError, AllocResult, PageAllocator};

pub(crate) const TEST_PAGE_SIZE: usize = 0x1000;

pub(crate) struct MockPageAllocator {
    allocated: SpinNoIrq<Vec<(usize, Layout, usize)>>,
    limit: Option<usize>,
}

impl MockPageAllocator {
    pub(crate) fn new() -> Self {
        Self {
            allocated: SpinNoIrq::new(Vec::new()),
            limit: None,
        }
    }

    /// Fails every request once `blocks` blocks are outstanding.
    pub(crate) fn with_limit(blocks: usize) -> Self {
        Self {
            allocated: SpinNoIrq::new(Vec::new()),
            limit: Some(blocks),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.allocated.lock().len()
    }
}

impl PageAllocator for MockPageAllocator {
    const PAGE_SIZE: usize = TEST_PAGE_SIZE;

    fn alloc_zero(&self, order: usize) -> AllocResult<usize> {
        let mut allocated = self.allocated.lock();
        if self.limit.is_some_and(|limit| allocated.len() >= limit) {
            return Err(AllocError::NoMemory);
        }
        let size = (1 << order) * TEST_PAGE_SIZE;
        let layout = Layout::from_size_align(size, size).map_err(|_| AllocError::InvalidParam)?;
        let addr = unsafe { alloc_zeroed(layout) } as usize;
        if addr == 0 {
            return Err(AllocError::NoMemory);
        }
        allocated.push((addr, layout, order));
        Ok(addr)
    }

    fn free(&self, addr: usize, order: usize) {
        let mut allocated = self.allocated.lock();
        let idx = allocated
            .iter()
            .position(|&(pos, _, o)| pos == addr && o == order)
            .unwrap_or_else(|| panic!("freeing unknown block {:#x} (order {})", addr, order));
        let (_, layout, _) = allocated.swap_remove(idx);
        unsafe { dealloc(addr as *mut u8, layout) };
    }
}

impl Drop for MockPageAllocator {
    fn drop(&mut self) {
        for (addr, layout, _) in self.allocated.lock().drain(..) {
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }
}
