//! Slab cache implementation for a single object size.
//!
//! This module implements SlabCache which manages three lists (free, partial,
//! full) of slab nodes. It holds no lock of its own; the owning cache
//! descriptor serializes every call.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "log")]
use log::{debug, error};

use super::layout::SlabLayout;
use super::slab_node::{SlabNode, SlabState};
use super::{ObjectCtor, ObjectDtor};
use crate::{AllocError, AllocResult, PageAllocator};

static NEXT_OWNER: AtomicUsize = AtomicUsize::new(1);

/// Slabs of one [`SlabState`], doubly linked through their headers.
///
/// Every linked slab carries the list's state tag, so a slab reached by
/// address knows which list to unlink it from.
struct SlabList {
    state: SlabState,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl SlabList {
    const fn new(state: SlabState) -> Self {
        Self {
            state,
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn last(&self) -> Option<usize> {
        self.tail
    }

    fn push(&mut self, node: &mut SlabNode) {
        node.set_list(Some(self.state));
        node.set_prev(self.tail);
        node.set_next(None);
        match self.tail {
            Some(tail) => SlabNode::new(tail, node.layout).set_next(Some(node.addr)),
            None => self.head = Some(node.addr),
        }
        self.tail = Some(node.addr);
        self.len += 1;
    }

    fn unlink(&mut self, node: &mut SlabNode) {
        debug_assert_eq!(node.list(), Some(self.state));
        let (prev, next) = (node.prev(), node.next());
        match prev {
            Some(prev) => SlabNode::new(prev, node.layout).set_next(next),
            None => self.head = next,
        }
        match next {
            Some(next) => SlabNode::new(next, node.layout).set_prev(prev),
            None => self.tail = prev,
        }
        node.set_prev(None);
        node.set_next(None);
        node.set_list(None);
        self.len -= 1;
    }

    fn pop(&mut self, layout: SlabLayout) -> Option<SlabNode> {
        let mut node = SlabNode::new(self.tail?, layout);
        self.unlink(&mut node);
        Some(node)
    }

    #[cfg(test)]
    fn iter(&self, layout: SlabLayout) -> impl Iterator<Item = SlabNode> {
        core::iter::successors(self.head.map(|addr| SlabNode::new(addr, layout)), move |node| {
            node.next().map(|addr| SlabNode::new(addr, layout))
        })
    }
}

/// Slab lists and counters of one cache
pub struct SlabCache {
    layout: SlabLayout,
    /// Written into every slab this cache formats.
    owner: usize,
    free: SlabList,
    partial: SlabList,
    full: SlabList,
    objects_count: usize,
    slabs: usize,
    in_use: usize,
}

impl SlabCache {
    pub fn new(layout: SlabLayout) -> Self {
        Self {
            layout,
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            free: SlabList::new(SlabState::Free),
            partial: SlabList::new(SlabState::Partial),
            full: SlabList::new(SlabState::Full),
            objects_count: 0,
            slabs: 0,
            in_use: 0,
        }
    }

    pub fn layout(&self) -> &SlabLayout {
        &self.layout
    }

    /// Total object capacity of the slabs owned by this cache.
    pub fn objects_count(&self) -> usize {
        self.objects_count
    }

    pub fn slabs(&self) -> usize {
        self.slabs
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Slab counts of the free, partial and full lists.
    pub fn list_lens(&self) -> (usize, usize, usize) {
        (self.free.len(), self.partial.len(), self.full.len())
    }

    fn list_mut(&mut self, state: SlabState) -> &mut SlabList {
        match state {
            SlabState::Free => &mut self.free,
            SlabState::Partial => &mut self.partial,
            SlabState::Full => &mut self.full,
        }
    }

    /// Moves `node` to the list matching its occupancy.
    fn settle(&mut self, node: &mut SlabNode) {
        let target = node.occupancy();
        let current = node.list();
        if current == Some(target) {
            return;
        }
        if let Some(current) = current {
            self.list_mut(current).unlink(node);
        }
        self.list_mut(target).push(node);
    }

    /// Formats a zeroed page block of `order` into slabs and puts them on the
    /// free list. Returns the number of slabs added, 0 if the block cannot
    /// hold a slab or is not aligned to its size.
    pub fn add_block(&mut self, block: usize, order: usize, ctor: Option<ObjectCtor>) -> usize {
        let layout = self.layout;
        let count = layout.slabs_per_block(order);
        if count == 0 {
            error!(
                "slab cache: block order {} is smaller than slab order {}",
                order,
                layout.slab_order()
            );
            return 0;
        }
        if block == 0 || block & ((layout.page_size() << order) - 1) != 0 {
            error!("slab cache: block {:#x} is not aligned to order {}", block, order);
            return 0;
        }

        // Last slab first, so the block's first slab ends up at the back and
        // is handed out first.
        for i in (0..count).rev() {
            let mut node = SlabNode::new(block + i * layout.slab_bytes(), layout);
            node.format(block, order, self.owner, ctor);
            self.free.push(&mut node);
        }
        SlabNode::new(block, layout).set_block_slabs(count);

        self.slabs += count;
        self.objects_count += count * layout.objects_per_slab();
        count
    }

    /// Allocate an object from this cache without growing it.
    ///
    /// Partial slabs are drained before a free slab is touched.
    pub fn alloc_object(&mut self) -> Option<NonNull<u8>> {
        let slab_base = self.partial.last().or_else(|| self.free.last())?;
        let mut node = SlabNode::new(slab_base, self.layout);
        let Some(obj) = node.alloc_object() else {
            panic!(
                "Allocation from {:?} slab {:#x} failed, free list corruption detected",
                node.list(),
                slab_base
            );
        };
        self.settle(&mut node);
        self.in_use += 1;
        Some(obj)
    }

    /// Finds the slab of this cache holding `addr`.
    ///
    /// Slabs are aligned to their size, so the candidate header sits at the
    /// address rounded down; it must carry this cache's tag and be linked.
    fn owning_slab(&self, addr: usize) -> Option<SlabNode> {
        let base = addr & !(self.layout.slab_bytes() - 1);
        if base == 0 {
            return None;
        }
        let node = SlabNode::new(base, self.layout);
        (node.is_valid() && node.owner() == self.owner && node.list().is_some()).then_some(node)
    }

    /// Deallocate an object and move its slab to the list matching its new
    /// occupancy.
    pub fn dealloc_object(&mut self, obj_addr: usize) -> AllocResult {
        let Some(mut node) = self.owning_slab(obj_addr) else {
            error!("slab cache: {:#x} is not inside any slab of this cache", obj_addr);
            return Err(AllocError::InvalidParam);
        };
        let index = node
            .object_index_from_addr(obj_addr)
            .ok_or(AllocError::InvalidParam)?;
        node.dealloc_object(index)?;
        self.in_use -= 1;
        self.settle(&mut node);
        Ok(())
    }

    /// Drops a slab that is on no list anymore, releasing its block once the
    /// block has no slab left.
    fn release_slab<P: PageAllocator + ?Sized>(&mut self, node: &mut SlabNode, pages: &P) {
        self.slabs -= 1;
        self.objects_count -= self.layout.objects_per_slab();
        if let Some((block, order)) = node.retire() {
            debug!("slab cache: releasing block {:#x} (order {})", block, order);
            pages.free(block, order);
        }
    }

    /// Reclaims every slab on the free list. Returns the number of slabs reclaimed.
    pub fn shrink<P: PageAllocator + ?Sized>(&mut self, pages: &P, dtor: Option<ObjectDtor>) -> usize {
        let object_size = self.layout.object_size();
        let mut reclaimed = 0;
        while let Some(mut node) = self.free.pop(self.layout) {
            if let Some(dtor) = dtor {
                node.for_each_object(|obj, _| dtor(obj, object_size));
            }
            self.release_slab(&mut node, pages);
            reclaimed += 1;
        }
        reclaimed
    }

    /// Reclaims every slab of the cache, destructing objects still lent out.
    pub fn destroy<P: PageAllocator + ?Sized>(&mut self, pages: &P, dtor: Option<ObjectDtor>) {
        let layout = self.layout;
        for state in [SlabState::Full, SlabState::Partial, SlabState::Free] {
            while let Some(mut node) = self.list_mut(state).pop(layout) {
                if let Some(dtor) = dtor {
                    node.for_each_object(|obj, used| {
                        if used {
                            dtor(obj, layout.object_size());
                        }
                    });
                }
                self.in_use -= node.in_use();
                self.release_slab(&mut node, pages);
            }
        }
    }

    /// Checks that every slab sits on the list matching its occupancy and
    /// that the counters agree with the lists.
    #[cfg(test)]
    pub(crate) fn lists_consistent(&self) -> bool {
        let layout = self.layout;
        let per_slab = layout.objects_per_slab();
        let mut slabs = 0;
        let mut in_use = 0;
        for (list, state) in [
            (&self.free, SlabState::Free),
            (&self.partial, SlabState::Partial),
            (&self.full, SlabState::Full),
        ] {
            let mut len = 0;
            for node in list.iter(layout) {
                let expected = match node.free_count() {
                    0 => SlabState::Full,
                    n if n == per_slab => SlabState::Free,
                    _ => SlabState::Partial,
                };
                if !node.is_valid()
                    || node.owner() != self.owner
                    || node.list() != Some(state)
                    || expected != state
                {
                    return false;
                }
                // The free list length must match the free counter
                let mut free_slots = 0;
                node.for_each_object(|_, used| free_slots += (!used) as usize);
                if free_slots != node.free_count() {
                    return false;
                }
                in_use += node.in_use();
                len += 1;
            }
            if len != list.len() {
                return false;
            }
            slabs += len;
        }
        slabs == self.slabs && in_use == self.in_use && self.objects_count == slabs * per_slab
    }
}
