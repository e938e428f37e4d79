//! Cache descriptors.
//!
//! A [`Cache`] pairs one object size and constructor/destructor with the slab
//! lists holding its objects. Descriptors are not allocated on their own: they
//! are written into object slots of the registry's bootstrap cache.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::{debug, trace, warn};

use crate::slab::{ObjectCtor, ObjectDtor, SlabCache, SlabLayout};
use crate::{AllocError, AllocResult, PageAllocator};

/// Occupancy snapshot of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub name: &'static str,
    pub object_size: usize,
    pub objects_per_slab: usize,
    pub pages_per_slab: usize,
    /// Object capacity of all slabs currently owned by the cache.
    pub objects_count: usize,
    pub objects_in_use: usize,
    pub slabs: usize,
    pub slabs_free: usize,
    pub slabs_partial: usize,
    pub slabs_full: usize,
}

/// A pool of same-size objects.
pub struct Cache {
    name: &'static str,
    layout: SlabLayout,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,
    slabs: SpinNoIrq<SlabCache>,
    /// Registry link, guarded by the registry lock.
    next: AtomicPtr<Cache>,
}

impl Cache {
    pub(crate) fn new(
        name: &'static str,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
        slabs: SlabCache,
    ) -> Self {
        Self {
            name,
            layout: *slabs.layout(),
            ctor,
            dtor,
            slabs: SpinNoIrq::new(slabs),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.layout.object_size()
    }

    pub fn objects_per_slab(&self) -> usize {
        self.layout.objects_per_slab()
    }

    pub fn layout(&self) -> &SlabLayout {
        &self.layout
    }

    pub fn stats(&self) -> CacheStats {
        let slabs = self.slabs.lock();
        let (slabs_free, slabs_partial, slabs_full) = slabs.list_lens();
        CacheStats {
            name: self.name,
            object_size: self.layout.object_size(),
            objects_per_slab: self.layout.objects_per_slab(),
            pages_per_slab: self.layout.slab_pages(),
            objects_count: slabs.objects_count(),
            objects_in_use: slabs.in_use(),
            slabs: slabs.slabs(),
            slabs_free,
            slabs_partial,
            slabs_full,
        }
    }

    /// Allocates one object, growing the cache by a slab when every slab is full.
    pub(crate) fn alloc_object<P: PageAllocator + ?Sized>(
        &self,
        pages: &P,
    ) -> AllocResult<NonNull<u8>> {
        let mut slabs = self.slabs.lock();
        if let Some(obj) = slabs.alloc_object() {
            trace!("cache {}: alloc {:p} ({} bytes)", self.name, obj, self.object_size());
            return Ok(obj);
        }

        let order = self.layout.slab_order();
        let block = pages.alloc_zero(order).map_err(|_e| {
            warn!(
                "cache {}: cannot grow by {} pages: {:?}",
                self.name,
                self.layout.slab_pages(),
                _e
            );
            AllocError::NoMemory
        })?;
        if slabs.add_block(block, order, self.ctor) == 0 {
            pages.free(block, order);
            return Err(AllocError::NoMemory);
        }
        debug!(
            "cache {}: grew to {} slabs ({} objects)",
            self.name,
            slabs.slabs(),
            slabs.objects_count()
        );

        let obj = slabs.alloc_object().ok_or(AllocError::NoMemory)?;
        trace!("cache {}: alloc {:p} ({} bytes)", self.name, obj, self.object_size());
        Ok(obj)
    }

    pub(crate) fn free_object(&self, obj: NonNull<u8>) -> AllocResult {
        let mut slabs = self.slabs.lock();
        slabs.dealloc_object(obj.as_ptr() as usize)?;
        trace!("cache {}: free {:p} ({} bytes)", self.name, obj, self.object_size());
        Ok(())
    }

    pub(crate) fn shrink_slabs<P: PageAllocator + ?Sized>(&self, pages: &P) -> usize {
        let reclaimed = self.slabs.lock().shrink(pages, self.dtor);
        if reclaimed > 0 {
            debug!("cache {}: reclaimed {} free slabs", self.name, reclaimed);
        }
        reclaimed
    }

    pub(crate) fn release_slabs<P: PageAllocator + ?Sized>(&self, pages: &P) {
        self.slabs.lock().destroy(pages, self.dtor);
    }

    pub(crate) fn next(&self) -> Option<NonNull<Cache>> {
        NonNull::new(self.next.load(Ordering::Acquire))
    }

    pub(crate) fn set_next(&self, next: Option<NonNull<Cache>>) {
        let next = next.map_or(ptr::null_mut(), NonNull::as_ptr);
        self.next.store(next, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn lists_consistent(&self) -> bool {
        self.slabs.lock().lists_consistent()
    }
}

impl core::fmt::Debug for Cache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("object_size", &self.layout.object_size())
            .field("objects_per_slab", &self.layout.objects_per_slab())
            .finish()
    }
}
