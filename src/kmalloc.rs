//! Thirteen-size-class `kmalloc`/`kfree` surface over the cache layer.

use core::fmt::Write;
use core::ptr::NonNull;

use crate::allocator::{off_slab_ref_for, AllocatorInner};
use crate::slab::Cache;
use crate::{NUM_SIZE_CLASSES, SIZE_CLASS_MAX_SHIFT, SIZE_CLASS_MIN_SHIFT};

/// Lazily populated table of the thirteen power-of-two size classes,
/// `32 B ..= 131072 B`.
pub struct SizeClassTable {
    pub(crate) classes: [Option<NonNull<Cache>>; NUM_SIZE_CLASSES],
}

impl SizeClassTable {
    pub const fn new() -> Self {
        Self {
            classes: [None; NUM_SIZE_CLASSES],
        }
    }
}

/// `index = log2(size) - 5`, valid only for sizes that are already
/// power-of-two and within `[32, 131072]`.
pub fn size_class_index(size: usize) -> Option<usize> {
    if size < class_size(0) || size > class_size(NUM_SIZE_CLASSES - 1) {
        return None;
    }
    let shift = size.trailing_zeros();
    Some((shift - SIZE_CLASS_MIN_SHIFT) as usize)
}

pub fn class_size(index: usize) -> usize {
    1usize << (SIZE_CLASS_MIN_SHIFT + index as u32)
}

fn decimal_name(value: usize) -> heapless::String<20> {
    let mut s: heapless::String<20> = heapless::String::new();
    let _ = write!(s, "{value}");
    s
}

impl AllocatorInner {
    pub(crate) fn kmalloc_raw(&mut self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let rounded = size
            .next_power_of_two()
            .max(1usize << SIZE_CLASS_MIN_SHIFT);
        if rounded > (1usize << SIZE_CLASS_MAX_SHIFT) {
            return None;
        }
        let index = size_class_index(rounded)?;

        if self.size_classes.classes[index].is_none() {
            let name = decimal_name(rounded);
            let handle = self.create_cache_raw(name.as_str(), rounded, None, None).ok()?;
            self.size_classes.classes[index] = Some(handle);
        }

        let mut handle = self.size_classes.classes[index].unwrap();
        let cache = unsafe { handle.as_mut() };
        let off_slab_ref = off_slab_ref_for(&mut self.off_slab_cache, cache.off_slab);
        cache.alloc(&mut self.buddy, off_slab_ref)
    }

    pub(crate) fn kfree_raw(&mut self, obj: usize) {
        for i in 0..NUM_SIZE_CLASSES {
            if let Some(mut handle) = self.size_classes.classes[i] {
                let cache = unsafe { handle.as_mut() };
                let off_slab_ref = off_slab_ref_for(&mut self.off_slab_cache, cache.off_slab);
                if cache.free(obj, &mut self.buddy, off_slab_ref).is_ok() {
                    return;
                }
            }
        }
    }
}
