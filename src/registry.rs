//! Cache registry.
//!
//! The registry owns the page allocator and a singly linked list of every
//! cache, rooted at the bootstrap cache `caches`. That cache hands out the
//! memory of every cache descriptor, its own included: at initialization its
//! descriptor is written into the first object slot of its own first slab.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::{debug, error, info, warn};

use crate::cache::{Cache, CacheStats};
use crate::slab::{ObjectCtor, ObjectDtor, SlabCache, SlabLayout, OBJECT_ALIGN};
use crate::{AllocError, AllocResult, PageAllocator, MAX_ORDER};

/// Name of the bootstrap cache holding every cache descriptor.
pub const CACHES_CACHE_NAME: &str = "caches";

/// Page order of the block formatted into the bootstrap cache at init.
pub const CACHES_CACHE_ORDER: usize = 2;

/// Registry of every cache, backed by a page allocator.
pub struct SlabRegistry<P: PageAllocator> {
    pages: P,
    /// Bootstrap cache, always the registry head.
    head: NonNull<Cache>,
    /// Number of registered caches; the lock also guards the registry links.
    links: SpinNoIrq<usize>,
    _marker: PhantomData<Cache>,
}

// SAFETY: the descriptors reachable from `head` are only mutated behind their
// own SpinNoIrq locks or the registry lock.
unsafe impl<P: PageAllocator + Send> Send for SlabRegistry<P> {}
unsafe impl<P: PageAllocator + Sync> Sync for SlabRegistry<P> {}

impl<P: PageAllocator> SlabRegistry<P> {
    /// Creates the registry and its bootstrap cache.
    ///
    /// Nothing can be allocated before this succeeds, so failing to get the
    /// bootstrap block from the page allocator halts.
    pub fn init(pages: P) -> Self {
        match Self::try_init(pages) {
            Ok(registry) => registry,
            Err(_e) => {
                error!("slab registry: bootstrap failed: {:?}", _e);
                panic!("Cannot allocate cache for slab allocator!");
            }
        }
    }

    /// Like [`SlabRegistry::init`], but reports bootstrap failure.
    pub fn try_init(pages: P) -> AllocResult<Self> {
        Self::with_bootstrap_order(pages, CACHES_CACHE_ORDER)
    }

    /// Creates the registry with a bootstrap block of `2^order` pages.
    ///
    /// The order is raised to at least one slab of cache descriptors.
    pub fn with_bootstrap_order(pages: P, order: usize) -> AllocResult<Self> {
        debug_assert!(align_of::<Cache>() <= OBJECT_ALIGN);
        let layout = SlabLayout::new(size_of::<Cache>(), P::PAGE_SIZE)?;
        let order = order.max(layout.slab_order());
        if order > MAX_ORDER {
            return Err(AllocError::InvalidParam);
        }

        let block = pages.alloc_zero(order).map_err(|_| AllocError::NoMemory)?;

        // Phase 1: format the block before any descriptor exists to own it,
        // then take the first slot for the bootstrap descriptor itself.
        let mut slabs = SlabCache::new(layout);
        slabs.add_block(block, order, None);
        let Some(slot) = slabs.alloc_object() else {
            pages.free(block, order);
            return Err(AllocError::NoMemory);
        };
        let head = slot.cast::<Cache>();
        unsafe { head.as_ptr().write(Cache::new(CACHES_CACHE_NAME, None, None, slabs)) };

        debug!(
            "slab registry: bootstrap cache at {:#x}, {} descriptors per slab",
            block,
            layout.objects_per_slab()
        );

        Ok(Self {
            pages,
            head,
            links: SpinNoIrq::new(1),
            _marker: PhantomData,
        })
    }

    /// The page allocator backing every cache.
    pub fn page_allocator(&self) -> &P {
        &self.pages
    }

    fn caches_cache(&self) -> &Cache {
        unsafe { self.head.as_ref() }
    }

    /// Creates a cache of `objects_count` objects of `object_size` bytes.
    ///
    /// `ctor` runs once per object when its slab is formatted, `dtor` when the
    /// slab is reclaimed. The name is borrowed for the cache's lifetime.
    pub fn create(
        &self,
        name: &'static str,
        object_size: usize,
        objects_count: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> AllocResult<CacheRef<'_, P>> {
        if objects_count == 0 {
            return Err(AllocError::InvalidParam);
        }
        let layout = SlabLayout::new(object_size, P::PAGE_SIZE)?;
        let order = layout.block_order_for(objects_count)?;

        // Phase 2: descriptors come from the bootstrap cache, which grows like
        // any other cache.
        let caches_cache = self.caches_cache();
        let slot = caches_cache.alloc_object(&self.pages)?;
        let mut slabs = SlabCache::new(layout);
        if let Err(_e) = self.fill(&mut slabs, order, ctor) {
            warn!(
                "slab registry: no memory for cache {} (order {}): {:?}",
                name, order, _e
            );
            if let Err(_e) = caches_cache.free_object(slot) {
                error!("slab registry: descriptor slot {:p} not returned: {:?}", slot, _e);
            }
            return Err(AllocError::NoMemory);
        }

        let cache = slot.cast::<Cache>();
        unsafe { cache.as_ptr().write(Cache::new(name, ctor, dtor, slabs)) };
        self.register(cache);

        debug!(
            "slab registry: created cache {} (object size {}, {} objects in {} pages)",
            name,
            object_size,
            layout.slabs_per_block(order) * layout.objects_per_slab(),
            1usize << order
        );
        Ok(CacheRef::new(self, cache))
    }

    /// Formats one block of `2^order` pages into `slabs`.
    fn fill(&self, slabs: &mut SlabCache, order: usize, ctor: Option<ObjectCtor>) -> AllocResult {
        let block = self.pages.alloc_zero(order)?;
        if slabs.add_block(block, order, ctor) == 0 {
            self.pages.free(block, order);
            return Err(AllocError::NoMemory);
        }
        Ok(())
    }

    /// Appends `cache` at the tail of the registry.
    fn register(&self, cache: NonNull<Cache>) {
        let mut len = self.links.lock();
        let mut tail = self.head;
        while let Some(next) = unsafe { tail.as_ref() }.next() {
            tail = next;
        }
        unsafe { tail.as_ref() }.set_next(Some(cache));
        *len += 1;
    }

    /// Unlinks `cache` from the registry. The bootstrap cache is never unlinked.
    fn unregister(&self, cache: NonNull<Cache>) -> bool {
        let mut len = self.links.lock();
        let mut prev = self.head;
        while let Some(next) = unsafe { prev.as_ref() }.next() {
            if next == cache {
                let after = unsafe { next.as_ref() }.next();
                unsafe { prev.as_ref() }.set_next(after);
                unsafe { next.as_ref() }.set_next(None);
                *len -= 1;
                return true;
            }
            prev = next;
        }
        false
    }

    fn link_after(&self, cache: NonNull<Cache>) -> Option<NonNull<Cache>> {
        let _guard = self.links.lock();
        unsafe { cache.as_ref() }.next()
    }

    /// Looks a cache up by name.
    pub fn get(&self, name: &str) -> Option<CacheRef<'_, P>> {
        let _guard = self.links.lock();
        let mut cur = Some(self.head);
        while let Some(cache) = cur {
            let cache_ref = unsafe { cache.as_ref() };
            if cache_ref.name() == name {
                return Some(CacheRef::new(self, cache));
            }
            cur = cache_ref.next();
        }
        None
    }

    /// The registry head (the bootstrap cache), for enumeration.
    pub fn get_all(&self) -> CacheRef<'_, P> {
        CacheRef::new(self, self.head)
    }

    /// Iterates over every registered cache, bootstrap cache first.
    pub fn iter(&self) -> CacheIter<'_, P> {
        CacheIter {
            registry: self,
            next: Some(self.head),
        }
    }

    /// Number of registered caches, bootstrap cache included.
    pub fn len(&self) -> usize {
        *self.links.lock()
    }

    /// Always false: the bootstrap cache is registered for the registry's lifetime.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dumps the occupancy of every cache.
    pub fn print_caches(&self) {
        info!("========== Slab Caches Info ==========");
        info!("Total caches: {}", self.len());
        for cache in self.iter() {
            let _stats: CacheStats = cache.stats();
            info!(
                "{:<16} objsize {:>6} per_slab {:>4} pages_per_slab {:>3} objects {:>6}/{:<6} slabs {} (free {}, partial {}, full {})",
                _stats.name,
                _stats.object_size,
                _stats.objects_per_slab,
                _stats.pages_per_slab,
                _stats.objects_in_use,
                _stats.objects_count,
                _stats.slabs,
                _stats.slabs_free,
                _stats.slabs_partial,
                _stats.slabs_full
            );
        }
        info!("======================================");
    }

    /// Tears `cache` down and returns its descriptor to the bootstrap cache.
    ///
    /// # Safety
    ///
    /// No handle to `cache` may be used after this returns.
    unsafe fn destroy(&self, cache: NonNull<Cache>) -> AllocResult {
        if cache == self.head {
            error!("slab registry: the bootstrap cache cannot be destroyed");
            return Err(AllocError::InvalidParam);
        }
        if !self.unregister(cache) {
            error!("slab registry: destroying unregistered cache {:p}", cache);
            return Err(AllocError::InvalidParam);
        }

        let _name = unsafe { cache.as_ref() }.name();
        unsafe { cache.as_ref() }.release_slabs(&self.pages);
        unsafe { ptr::drop_in_place(cache.as_ptr()) };
        self.caches_cache().free_object(cache.cast())?;
        debug!("slab registry: destroyed cache {}", _name);
        Ok(())
    }
}

/// Handle to a registered cache.
pub struct CacheRef<'r, P: PageAllocator> {
    registry: &'r SlabRegistry<P>,
    cache: NonNull<Cache>,
}

// SAFETY: a CacheRef only hands out shared access to a Cache, which is Sync.
unsafe impl<P: PageAllocator + Sync> Send for CacheRef<'_, P> {}
unsafe impl<P: PageAllocator + Sync> Sync for CacheRef<'_, P> {}

impl<P: PageAllocator> Clone for CacheRef<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: PageAllocator> Copy for CacheRef<'_, P> {}

impl<P: PageAllocator> PartialEq for CacheRef<'_, P> {
    fn eq(&self, other: &Self) -> bool {
        self.cache == other.cache
    }
}

impl<P: PageAllocator> Eq for CacheRef<'_, P> {}

impl<P: PageAllocator> core::fmt::Debug for CacheRef<'_, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&**self, f)
    }
}

impl<P: PageAllocator> core::ops::Deref for CacheRef<'_, P> {
    type Target = Cache;

    fn deref(&self) -> &Cache {
        unsafe { self.cache.as_ref() }
    }
}

impl<'r, P: PageAllocator> CacheRef<'r, P> {
    fn new(registry: &'r SlabRegistry<P>, cache: NonNull<Cache>) -> Self {
        Self { registry, cache }
    }

    /// True for the bootstrap cache, whose slots are managed by the registry.
    pub fn is_bootstrap(&self) -> bool {
        self.cache == self.registry.head
    }

    /// Allocates a constructed object and returns its content region.
    ///
    /// Descriptor slots of the bootstrap cache are only handed out by
    /// [`SlabRegistry::create`], so allocating from it is
    /// [`AllocError::InvalidParam`].
    pub fn alloc(&self) -> AllocResult<NonNull<u8>> {
        if self.is_bootstrap() {
            warn!("slab registry: alloc from the bootstrap cache rejected");
            return Err(AllocError::InvalidParam);
        }
        self.alloc_object(&self.registry.pages)
    }

    /// Returns an object to the cache. A null pointer is a no-op.
    ///
    /// Pointers that are not the start of an object of this cache are
    /// rejected with [`AllocError::InvalidParam`], objects that are not
    /// allocated with [`AllocError::NotAllocated`]. Descriptors go back to
    /// the bootstrap cache through [`CacheRef::destroy`] only.
    pub fn free(&self, obj: *mut u8) -> AllocResult {
        let Some(obj) = NonNull::new(obj) else {
            return Ok(());
        };
        if self.is_bootstrap() {
            error!("slab registry: free of descriptor slot {:p} rejected", obj);
            return Err(AllocError::InvalidParam);
        }
        self.free_object(obj)
    }

    /// Releases the slabs holding no live object to the page allocator.
    ///
    /// Returns the number of slabs reclaimed. On the bootstrap cache this only
    /// drops slabs without a live descriptor; the slab holding the registry
    /// head always stays.
    pub fn shrink(&self) -> usize {
        self.shrink_slabs(&self.registry.pages)
    }

    /// The next cache in the registry.
    pub fn next(&self) -> Option<CacheRef<'r, P>> {
        self.registry
            .link_after(self.cache)
            .map(|cache| CacheRef::new(self.registry, cache))
    }

    /// Destroys the cache: every slab is released, the destructor runs on
    /// objects still allocated, and the cache leaves the registry.
    ///
    /// # Safety
    ///
    /// Neither this handle nor any copy of it, nor any object allocated from
    /// the cache, may be used after this returns.
    pub unsafe fn destroy(self) -> AllocResult {
        unsafe { self.registry.destroy(self.cache) }
    }
}

/// Iterator over the registered caches.
pub struct CacheIter<'r, P: PageAllocator> {
    registry: &'r SlabRegistry<P>,
    next: Option<NonNull<Cache>>,
}

impl<'r, P: PageAllocator> Iterator for CacheIter<'r, P> {
    type Item = CacheRef<'r, P>;

    fn next(&mut self) -> Option<CacheRef<'r, P>> {
        let cache = self.next?;
        self.next = self.registry.link_after(cache);
        Some(CacheRef::new(self.registry, cache))
    }
}
