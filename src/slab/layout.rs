//! Slab geometry.
//!
//! A [`SlabLayout`] is derived once per cache from the object size and the
//! page size, and every slab access goes through it instead of recomputing
//! offsets inline.

use core::mem::size_of;

use super::slab_node::{ObjectHeader, SlabHeader};
use crate::{AllocError, AllocResult, MAX_ORDER};

/// Alignment of every object slot and of every content region.
pub const OBJECT_ALIGN: usize = 2 * size_of::<usize>();

/// Geometry of the slabs of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabLayout {
    object_size: usize,
    stride: usize,
    header_size: usize,
    objects_per_slab: usize,
    slab_order: usize,
    page_size: usize,
}

impl SlabLayout {
    /// Size of the header that precedes every object's content region.
    pub const OBJECT_HEADER_SIZE: usize = size_of::<ObjectHeader>();

    /// Computes the layout for objects of `object_size` bytes.
    ///
    /// A slab spans the smallest power-of-two number of pages that holds the
    /// slab header plus one object, so small objects share a page and large
    /// objects are never cut at a page boundary.
    pub fn new(object_size: usize, page_size: usize) -> AllocResult<Self> {
        if object_size == 0 || !page_size.is_power_of_two() {
            return Err(AllocError::InvalidParam);
        }

        let header_size = crate::align_up(size_of::<SlabHeader>(), OBJECT_ALIGN);
        let stride = object_size
            .checked_add(Self::OBJECT_HEADER_SIZE + OBJECT_ALIGN - 1)
            .ok_or(AllocError::InvalidParam)?
            & !(OBJECT_ALIGN - 1);
        let min_bytes = header_size
            .checked_add(stride)
            .ok_or(AllocError::InvalidParam)?;

        let pages = min_bytes.div_ceil(page_size);
        if pages > 1 << MAX_ORDER {
            return Err(AllocError::InvalidParam);
        }
        let pages = pages.next_power_of_two();
        let slab_order = pages.trailing_zeros() as usize;
        let objects_per_slab = (pages * page_size - header_size) / stride;

        Ok(Self {
            object_size,
            stride,
            header_size,
            objects_per_slab,
            slab_order,
            page_size,
        })
    }

    pub const fn object_size(&self) -> usize {
        self.object_size
    }

    /// Distance between two consecutive object slots (header included).
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Bytes reserved for the slab header at the start of every slab.
    pub const fn header_size(&self) -> usize {
        self.header_size
    }

    pub const fn objects_per_slab(&self) -> usize {
        self.objects_per_slab
    }

    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Page order of a single slab.
    pub const fn slab_order(&self) -> usize {
        self.slab_order
    }

    pub const fn slab_pages(&self) -> usize {
        1 << self.slab_order
    }

    pub const fn slab_bytes(&self) -> usize {
        self.slab_pages() * self.page_size
    }

    /// Offset of the header of object `index` from the slab base.
    pub const fn object_offset(&self, index: usize) -> usize {
        self.header_size + index * self.stride
    }

    /// Offset of the content region of object `index` from the slab base.
    pub const fn content_offset(&self, index: usize) -> usize {
        self.object_offset(index) + Self::OBJECT_HEADER_SIZE
    }

    /// Maps an offset from the slab base back to an object index.
    ///
    /// Only the exact start of a content region maps to an index.
    pub fn index_of_content(&self, offset: usize) -> Option<usize> {
        let rel = offset.checked_sub(self.content_offset(0))?;
        if rel % self.stride != 0 {
            return None;
        }
        let index = rel / self.stride;
        (index < self.objects_per_slab).then_some(index)
    }

    /// Maps an offset from the slab base to the index of the object header
    /// starting there.
    pub fn index_of_object(&self, offset: usize) -> Option<usize> {
        let rel = offset.checked_sub(self.header_size)?;
        if rel % self.stride != 0 {
            return None;
        }
        let index = rel / self.stride;
        (index < self.objects_per_slab).then_some(index)
    }

    /// Smallest block order whose slabs hold at least `objects_count` objects.
    pub fn block_order_for(&self, objects_count: usize) -> AllocResult<usize> {
        let slabs = objects_count.max(1).div_ceil(self.objects_per_slab);
        let pages = slabs
            .checked_mul(self.slab_pages())
            .filter(|&pages| pages <= 1 << MAX_ORDER)
            .ok_or(AllocError::NoMemory)?;
        Ok(pages.next_power_of_two().trailing_zeros() as usize)
    }

    /// Number of slabs a block of `order` is partitioned into.
    pub const fn slabs_per_block(&self, order: usize) -> usize {
        if order < self.slab_order {
            0
        } else {
            1 << (order - self.slab_order)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 0x1000;

    fn check_packing(layout: &SlabLayout) {
        let used = layout.header_size() + layout.objects_per_slab() * layout.stride();
        assert!(layout.objects_per_slab() >= 1);
        assert!(used <= layout.slab_bytes());
        assert!(used + layout.stride() > layout.slab_bytes());
        assert_eq!(layout.stride() % OBJECT_ALIGN, 0);
        assert!(layout.stride() >= layout.object_size() + SlabLayout::OBJECT_HEADER_SIZE);
    }

    #[test]
    fn test_small_objects_share_one_page() {
        let layout = SlabLayout::new(64, PAGE).unwrap();
        assert_eq!(layout.slab_order(), 0);
        assert_eq!(layout.slab_bytes(), PAGE);
        assert!(layout.objects_per_slab() > 1);
        check_packing(&layout);
    }

    #[test]
    fn test_large_objects_span_pages() {
        let page_sized = SlabLayout::new(PAGE, PAGE).unwrap();
        assert_eq!(page_sized.slab_pages(), 2);
        assert_eq!(page_sized.objects_per_slab(), 1);
        check_packing(&page_sized);

        let odd = SlabLayout::new(10_000, PAGE).unwrap();
        assert_eq!(odd.slab_pages(), 4);
        assert!(odd.slab_bytes() >= odd.header_size() + odd.stride());
        check_packing(&odd);
    }

    #[test]
    fn test_content_alignment() {
        for size in [1, 7, 24, 100, 333, 2048] {
            let layout = SlabLayout::new(size, PAGE).unwrap();
            for index in 0..layout.objects_per_slab() {
                assert_eq!(layout.content_offset(index) % OBJECT_ALIGN, 0);
            }
            check_packing(&layout);
        }
    }

    #[test]
    fn test_index_mapping() {
        let layout = SlabLayout::new(48, PAGE).unwrap();
        let off1 = layout.content_offset(1);
        assert_eq!(layout.index_of_content(layout.content_offset(0)), Some(0));
        assert_eq!(layout.index_of_content(off1), Some(1));
        assert_eq!(layout.index_of_content(off1 + 1), None);
        assert_eq!(layout.index_of_content(0), None);
        assert_eq!(
            layout.index_of_content(layout.content_offset(layout.objects_per_slab())),
            None
        );
        assert_eq!(layout.index_of_object(layout.object_offset(3)), Some(3));
        assert_eq!(layout.index_of_object(layout.content_offset(3)), None);
    }

    #[test]
    fn test_block_order_for() {
        let layout = SlabLayout::new(64, PAGE).unwrap();
        let per_slab = layout.objects_per_slab();
        assert_eq!(layout.block_order_for(1).unwrap(), 0);
        assert_eq!(layout.block_order_for(per_slab).unwrap(), 0);
        assert_eq!(layout.block_order_for(per_slab + 1).unwrap(), 1);
        assert_eq!(layout.block_order_for(per_slab * 3).unwrap(), 2);
        assert_eq!(layout.slabs_per_block(2), 4);

        let big = SlabLayout::new(PAGE, PAGE).unwrap();
        assert_eq!(big.block_order_for(1).unwrap(), 1);
        assert_eq!(big.block_order_for(3).unwrap(), 3);
        assert_eq!(big.slabs_per_block(3), 4);
        assert_eq!(big.slabs_per_block(0), 0);
    }

    #[test]
    fn test_invalid_layouts() {
        assert_eq!(SlabLayout::new(0, PAGE), Err(AllocError::InvalidParam));
        assert_eq!(SlabLayout::new(64, 3000), Err(AllocError::InvalidParam));
        assert_eq!(
            SlabLayout::new(usize::MAX - 4, PAGE),
            Err(AllocError::InvalidParam)
        );
        let layout = SlabLayout::new(64, PAGE).unwrap();
        assert_eq!(layout.block_order_for(usize::MAX), Err(AllocError::NoMemory));
    }
}
