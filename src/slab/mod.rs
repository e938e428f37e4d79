//! Slab layer.
//!
//! This module formats page blocks into slabs of fixed-size objects and keeps
//! the free / partial / full slab lists of a single cache.

use core::ptr::NonNull;

pub mod layout;
pub mod slab_cache;
pub mod slab_node;

// Re-export public types
pub use layout::{SlabLayout, OBJECT_ALIGN};
pub use slab_cache::SlabCache;
pub use slab_node::{SlabNode, SlabState, Slot};

/// Object constructor, run once per object when its slab is formatted.
///
/// Receives the object's content region and the cache's object size.
pub type ObjectCtor = fn(NonNull<u8>, usize);

/// Object destructor, run when the object's slab is reclaimed.
pub type ObjectDtor = fn(NonNull<u8>, usize);
