//! Slab object caches
//!
//! This crate implements the fixed-size object allocator layer of a kernel
//! memory subsystem, featuring:
//! - Page-aligned slabs carved from power-of-two page blocks
//! - Objects constructed once per slab lifetime, not on every allocation
//! - Free / partial / full slab lists per cache under a per-cache spinlock
//! - A cache registry whose descriptors are allocated from a bootstrap cache

#![no_std]

extern crate alloc;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default page size for backward compatibility
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// Largest block order the caches will ever request from the page allocator.
pub const MAX_ORDER: usize = 28;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid argument (zero sizes, foreign pointers, bootstrap cache destroy).
    InvalidParam,
    /// No enough memory to allocate.
    NoMemory,
    /// Deallocate an object that is not currently allocated.
    NotAllocated,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Page-granularity allocator consumed by the caches.
///
/// Implementations hand out zeroed blocks of `2^order` pages, aligned to their
/// own size, and must be safe to call from several caches at once.
pub trait PageAllocator {
    /// The size of a memory page.
    const PAGE_SIZE: usize;

    /// Allocate a zeroed block of `2^order` contiguous pages.
    fn alloc_zero(&self, order: usize) -> AllocResult<usize>;

    /// Release a block previously returned by [`PageAllocator::alloc_zero`]
    /// with the same `order`.
    fn free(&self, addr: usize, order: usize);
}

impl<T: PageAllocator + ?Sized> PageAllocator for &T {
    const PAGE_SIZE: usize = T::PAGE_SIZE;

    fn alloc_zero(&self, order: usize) -> AllocResult<usize> {
        (**self).alloc_zero(order)
    }

    fn free(&self, addr: usize, order: usize) {
        (**self).free(addr, order)
    }
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

pub mod slab;
pub use slab::{ObjectCtor, ObjectDtor, SlabLayout};

pub mod cache;
pub use cache::{Cache, CacheStats};

pub mod registry;
pub use registry::{CacheIter, CacheRef, SlabRegistry, CACHES_CACHE_NAME, CACHES_CACHE_ORDER};

#[cfg(test)]
pub(crate) mod test_pages;
