//! Slab node implementation.
//!
//! A slab describes itself: a [`SlabHeader`] sits at its first byte and is
//! followed by `objects_per_slab` object slots. Each slot starts with an
//! [`ObjectHeader`] whose free link chains the slab's free objects, so no
//! memory outside the slab is needed to manage it.

#[cfg(feature = "log")]
use log::error;

use core::ptr::NonNull;

use super::layout::SlabLayout;
use super::ObjectCtor;
use crate::{AllocError, AllocResult};

const SLAB_HEADER_MAGIC: u32 = 0x534c_4142;
const OBJ_USED: usize = 1;

/// Which list of a cache a slab sits on.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabState {
    Free = 1,
    Partial = 2,
    Full = 3,
}

impl SlabState {
    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::Free),
            2 => Some(Self::Partial),
            3 => Some(Self::Full),
            _ => None,
        }
    }
}

#[repr(C)]
pub(crate) struct SlabHeader {
    magic: u32,
    /// [`SlabState`] tag of the list holding the slab, 0 when detached.
    list: u32,
    /// Tag of the slab cache that formatted the slab.
    owner: usize,
    object_size: usize,
    object_count: usize,
    free_count: usize,
    /// Address of the first free object header, 0 when the slab is full.
    free_head: usize,
    /// Page block this slab was carved from.
    block: usize,
    block_order: usize,
    /// Only valid in the first slab of a block: slabs of the block still owned by the cache.
    block_slabs: usize,
    prev: usize,
    next: usize,
}

#[repr(C)]
pub(crate) struct ObjectHeader {
    state: usize,
    next_free: usize,
}

/// Decoded state of an object slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Free slot, linked to the next free object header of the same slab.
    Free { next: Option<usize> },
    /// Slot lent to a caller.
    Used,
}

impl ObjectHeader {
    fn slot(&self) -> Slot {
        if self.state & OBJ_USED != 0 {
            Slot::Used
        } else {
            Slot::Free {
                next: (self.next_free != 0).then_some(self.next_free),
            }
        }
    }

    fn set_slot(&mut self, slot: Slot) {
        match slot {
            Slot::Free { next } => {
                self.state &= !OBJ_USED;
                self.next_free = next.unwrap_or(0);
            }
            Slot::Used => {
                self.state |= OBJ_USED;
                self.next_free = 0;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SlabNode {
    pub addr: usize, // Slab base, also the address of its header
    pub layout: SlabLayout,
}

impl SlabNode {
    pub const fn new(addr: usize, layout: SlabLayout) -> Self {
        Self { addr, layout }
    }

    fn header(&self) -> &SlabHeader {
        unsafe { &*(self.addr as *const SlabHeader) }
    }

    fn header_mut(&mut self) -> &mut SlabHeader {
        unsafe { &mut *(self.addr as *mut SlabHeader) }
    }

    fn object_addr(&self, index: usize) -> usize {
        self.addr + self.layout.object_offset(index)
    }

    fn object(&self, index: usize) -> Option<&ObjectHeader> {
        if index >= self.layout.objects_per_slab() {
            return None;
        }
        Some(unsafe { &*(self.object_addr(index) as *const ObjectHeader) })
    }

    fn object_mut(&mut self, index: usize) -> Option<&mut ObjectHeader> {
        if index >= self.layout.objects_per_slab() {
            return None;
        }
        Some(unsafe { &mut *(self.object_addr(index) as *mut ObjectHeader) })
    }

    /// Content region of object `index`.
    pub fn object_ptr(&self, index: usize) -> NonNull<u8> {
        let addr = self.addr + self.layout.content_offset(index);
        // Slab bases are never null.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// Writes the slab header and links every object into the free list.
    ///
    /// `owner` tags the slab with the cache it belongs to. `ctor` runs once on
    /// each content region.
    pub fn format(
        &mut self,
        block: usize,
        block_order: usize,
        owner: usize,
        ctor: Option<ObjectCtor>,
    ) {
        let object_count = self.layout.objects_per_slab();
        let object_size = self.layout.object_size();
        let free_head = if object_count > 0 {
            self.object_addr(0)
        } else {
            0
        };

        *self.header_mut() = SlabHeader {
            magic: SLAB_HEADER_MAGIC,
            list: 0,
            owner,
            object_size,
            object_count,
            free_count: object_count,
            free_head,
            block,
            block_order,
            block_slabs: 0,
            prev: 0,
            next: 0,
        };

        for index in 0..object_count {
            let next = (index + 1 < object_count).then(|| self.object_addr(index + 1));
            if let Some(obj) = self.object_mut(index) {
                obj.state = 0;
                obj.set_slot(Slot::Free { next });
            }
            if let Some(ctor) = ctor {
                ctor(self.object_ptr(index), object_size);
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        let header = self.header();
        header.magic == SLAB_HEADER_MAGIC
            && header.object_size == self.layout.object_size()
            && header.object_count == self.layout.objects_per_slab()
    }

    pub fn owner(&self) -> usize {
        self.header().owner
    }

    /// The list the slab is linked on, if any.
    pub fn list(&self) -> Option<SlabState> {
        SlabState::from_tag(self.header().list)
    }

    pub fn set_list(&mut self, list: Option<SlabState>) {
        self.header_mut().list = list.map_or(0, |state| state as u32);
    }

    /// The list matching the slab's current occupancy.
    pub fn occupancy(&self) -> SlabState {
        let header = self.header();
        if header.free_count == 0 {
            SlabState::Full
        } else if header.free_count == header.object_count {
            SlabState::Free
        } else {
            SlabState::Partial
        }
    }

    pub fn in_use(&self) -> usize {
        let header = self.header();
        header.object_count - header.free_count
    }

    pub fn free_count(&self) -> usize {
        self.header().free_count
    }

    pub fn is_full(&self) -> bool {
        self.header().free_count == 0
    }

    /// True when no object of the slab is lent out.
    pub fn is_empty(&self) -> bool {
        self.header().free_count == self.header().object_count
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr && addr - self.addr < self.layout.slab_bytes()
    }

    pub fn slot(&self, index: usize) -> Option<Slot> {
        self.object(index).map(ObjectHeader::slot)
    }

    /// Pops the head of the free list and marks it used.
    pub fn alloc_object(&mut self) -> Option<NonNull<u8>> {
        let head = self.header().free_head;
        if head == 0 {
            return None;
        }
        let base = self.addr;
        let index = self.layout.index_of_object(head - base)?;
        let obj = self.object_mut(index)?;
        let next = match obj.slot() {
            Slot::Free { next } => next,
            Slot::Used => panic!(
                "slab {:#x}: free list links used object {}, corruption detected",
                base, index
            ),
        };
        obj.set_slot(Slot::Used);

        let header = self.header_mut();
        header.free_head = next.unwrap_or(0);
        header.free_count -= 1;
        Some(self.object_ptr(index))
    }

    /// Pushes object `index` back onto the free list.
    ///
    /// Fails with [`AllocError::NotAllocated`] if the object is already free.
    pub fn dealloc_object(&mut self, index: usize) -> AllocResult {
        let head = self.header().free_head;
        let slot_addr = self.object_addr(index);
        let obj = self.object_mut(index).ok_or(AllocError::InvalidParam)?;
        if obj.slot() != Slot::Used {
            return Err(AllocError::NotAllocated);
        }
        obj.set_slot(Slot::Free {
            next: (head != 0).then_some(head),
        });

        let header = self.header_mut();
        header.free_head = slot_addr;
        header.free_count += 1;
        Ok(())
    }

    /// Maps a content address inside this slab to its object index.
    pub fn object_index_from_addr(&self, obj_addr: usize) -> Option<usize> {
        if !self.contains(obj_addr) {
            return None;
        }
        let index = self.layout.index_of_content(obj_addr - self.addr);
        if index.is_none() {
            error!("Invalid object address: {:#x} in slab {:#x}", obj_addr, self.addr);
        }
        index
    }

    /// Calls `f` with every content region and whether it is lent out.
    pub fn for_each_object(&self, mut f: impl FnMut(NonNull<u8>, bool)) {
        for index in 0..self.layout.objects_per_slab() {
            let used = self.slot(index) == Some(Slot::Used);
            f(self.object_ptr(index), used);
        }
    }

    pub fn block(&self) -> usize {
        self.header().block
    }

    pub fn block_order(&self) -> usize {
        self.header().block_order
    }

    /// Records on the first slab of a block how many slabs the block holds.
    pub fn set_block_slabs(&mut self, slabs: usize) {
        self.header_mut().block_slabs = slabs;
    }

    /// Gives up this slab's share of its page block.
    ///
    /// Returns `(block, order)` once every slab of the block has been retired
    /// and the block can go back to the page allocator.
    pub fn retire(&mut self) -> Option<(usize, usize)> {
        let block = self.block();
        let order = self.block_order();
        let header = self.header_mut();
        header.magic = 0;
        header.list = 0;

        let mut first = SlabNode::new(block, self.layout);
        let header = first.header_mut();
        header.block_slabs = header.block_slabs.saturating_sub(1);
        (header.block_slabs == 0).then_some((block, order))
    }

    pub fn prev(&self) -> Option<usize> {
        let prev = self.header().prev;
        if prev == 0 {
            None
        } else {
            Some(prev)
        }
    }

    pub fn next(&self) -> Option<usize> {
        let next = self.header().next;
        if next == 0 {
            None
        } else {
            Some(next)
        }
    }

    pub fn set_prev(&mut self, prev: Option<usize>) {
        self.header_mut().prev = prev.unwrap_or(0);
    }

    pub fn set_next(&mut self, next: Option<usize>) {
        self.header_mut().next = next.unwrap_or(0);
    }
}
