//! Concurrency tests for the cache layer
//!
//! Several threads hammer the same cache and separate caches; no object may
//! ever be held by two threads at once.

use std::alloc::Layout;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use kspin::SpinNoIrq;
use slab_object_cache::{AllocError, AllocResult, PageAllocator, SlabRegistry};

const PAGE_SIZE: usize = 0x1000;
const THREADS: usize = 8;
const ROUNDS: usize = 200;
const BATCH: usize = 32;

struct HeapPages {
    allocated: SpinNoIrq<Vec<(usize, Layout)>>,
}

impl HeapPages {
    fn new() -> Self {
        Self {
            allocated: SpinNoIrq::new(Vec::new()),
        }
    }

    fn outstanding(&self) -> usize {
        self.allocated.lock().len()
    }
}

impl PageAllocator for HeapPages {
    const PAGE_SIZE: usize = PAGE_SIZE;

    fn alloc_zero(&self, order: usize) -> AllocResult<usize> {
        let size = PAGE_SIZE << order;
        let layout = Layout::from_size_align(size, size).map_err(|_| AllocError::InvalidParam)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(AllocError::NoMemory);
        }
        self.allocated.lock().push((ptr as usize, layout));
        Ok(ptr as usize)
    }

    fn free(&self, addr: usize, order: usize) {
        let mut allocated = self.allocated.lock();
        let idx = allocated
            .iter()
            .position(|&(pos, layout)| pos == addr && layout.size() == PAGE_SIZE << order)
            .expect("freeing a block that was never allocated");
        let (_, layout) = allocated.swap_remove(idx);
        unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
    }
}

impl Drop for HeapPages {
    fn drop(&mut self) {
        for (addr, layout) in self.allocated.lock().drain(..) {
            unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

#[test]
fn test_concurrent_alloc_free_same_cache() {
    let pages = HeapPages::new();
    let registry = SlabRegistry::init(&pages);
    let cache = registry.create("shared", 48, 64, None, None).unwrap();

    thread::scope(|s| {
        for tid in 0..THREADS {
            s.spawn(move || {
                let tag = tid as u8 + 1;
                for _ in 0..ROUNDS {
                    let mut held = Vec::with_capacity(BATCH);
                    for _ in 0..BATCH {
                        let obj = cache.alloc().unwrap();
                        unsafe { std::ptr::write_bytes(obj.as_ptr(), tag, 48) };
                        held.push(obj);
                    }
                    // Another holder of the same object would have overwritten the tag
                    for obj in &held {
                        let bytes = unsafe { std::slice::from_raw_parts(obj.as_ptr(), 48) };
                        assert!(bytes.iter().all(|&b| b == tag));
                    }
                    for obj in held {
                        cache.free(obj.as_ptr()).unwrap();
                    }
                }
            });
        }
    });

    let stats = cache.stats();
    assert_eq!(stats.objects_in_use, 0);
    assert_eq!(stats.slabs_free, stats.slabs);
    assert!(stats.objects_count >= THREADS * BATCH);
}

#[test]
fn test_concurrent_distinct_objects() {
    let pages = HeapPages::new();
    let registry = SlabRegistry::init(&pages);
    let cache = registry.create("distinct", 16, 16, None, None).unwrap();

    let per_thread: Vec<Vec<usize>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(move || {
                    (0..500)
                        .map(|_| cache.alloc().unwrap().as_ptr() as usize)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let all: HashSet<usize> = per_thread.iter().flatten().copied().collect();
    assert_eq!(all.len(), THREADS * 500);
    assert_eq!(cache.stats().objects_in_use, THREADS * 500);
}

#[test]
fn test_concurrent_create_and_destroy() {
    const NAMES: [&str; THREADS] = ["c0", "c1", "c2", "c3", "c4", "c5", "c6", "c7"];

    let pages = HeapPages::new();
    let registry = SlabRegistry::init(&pages);
    let created = AtomicUsize::new(0);

    thread::scope(|s| {
        for name in NAMES {
            let registry = &registry;
            let created = &created;
            s.spawn(move || {
                for round in 0..20 {
                    let cache = registry.create(name, 64 + round, 32, None, None).unwrap();
                    created.fetch_add(1, Ordering::SeqCst);
                    let obj = cache.alloc().unwrap();
                    cache.free(obj.as_ptr()).unwrap();
                    assert_eq!(registry.get(name), Some(cache));
                    unsafe { cache.destroy() }.unwrap();
                }
            });
        }
    });

    assert_eq!(created.load(Ordering::SeqCst), THREADS * 20);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.iter().count(), 1);
    assert_eq!(registry.get_all().stats().objects_in_use, 1);
    // Only the bootstrap cache's memory remains
    let bootstrap_slabs = registry.get_all().stats().slabs;
    assert!(pages.outstanding() >= 1 && pages.outstanding() <= bootstrap_slabs);
}
