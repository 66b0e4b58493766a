//! `CacheBlock`: a buddy-allocated page holding many `Cache` descriptors,
//! with its own index-linked free-slot list — the registry `Cache`
//! descriptors themselves live in.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use crate::slab::cache::Cache;
use crate::{FREE_END, PAGE};

/// Header for one page of `Cache` descriptors. The trailing index array
/// (`cache_num` `u32` entries) and the `Cache` descriptor array itself both
/// live immediately after this header, in that order.
#[repr(C)]
pub struct CacheBlock {
    first_cache: usize,
    pub next: Option<NonNull<CacheBlock>>,
    free: u32,
    inuse: usize,
    cache_num: usize,
}

impl CacheBlock {
    const fn header_size() -> usize {
        size_of::<CacheBlock>()
    }

    /// Maximum number of `Cache` descriptors that fit in one page alongside
    /// this header and the index array.
    pub const fn calc_num_caches() -> usize {
        let budget = PAGE.saturating_sub(Self::header_size());
        let align = align_of::<Cache>();
        let mut n = 0usize;
        loop {
            let candidate = n + 1;
            let index_bytes = candidate * 4;
            let padded = (index_bytes + align - 1) / align * align;
            let total = padded + candidate * size_of::<Cache>();
            if total > budget {
                break;
            }
            n = candidate;
        }
        n
    }

    unsafe fn index_array_ptr(cb: *mut CacheBlock) -> *mut u32 {
        (cb as *mut u8).add(Self::header_size()) as *mut u32
    }

    fn cache_array_offset(cache_num: usize) -> usize {
        let after_index = Self::header_size() + cache_num * 4;
        let align = align_of::<Cache>();
        (after_index + align - 1) / align * align
    }

    unsafe fn cache_array_ptr(cb: *mut CacheBlock, cache_num: usize) -> *mut Cache {
        (cb as *mut u8).add(Self::cache_array_offset(cache_num)) as *mut Cache
    }

    /// Initializes a freshly buddy-allocated page as a `CacheBlock`: an
    /// index-linked free list over every descriptor slot, all free.
    ///
    /// # Safety
    /// `ptr` must point to a valid, writable, page-sized, page-aligned
    /// buddy block.
    pub unsafe fn init_at(ptr: *mut CacheBlock) -> NonNull<CacheBlock> {
        let cache_num = Self::calc_num_caches();
        ptr.write(CacheBlock {
            first_cache: 0,
            next: None,
            free: 0,
            inuse: 0,
            cache_num,
        });

        let cache_array = Self::cache_array_ptr(ptr, cache_num);
        (*ptr).first_cache = cache_array as usize;

        let idx = Self::index_array_ptr(ptr);
        for i in 0..cache_num {
            let val = if i + 1 == cache_num {
                FREE_END
            } else {
                (i + 1) as u32
            };
            idx.add(i).write(val);
        }

        NonNull::new_unchecked(ptr)
    }

    pub fn is_full(&self) -> bool {
        self.free == FREE_END
    }

    pub fn is_empty(&self) -> bool {
        self.inuse == 0
    }

    pub fn owns(&self, cache_ptr: *mut Cache) -> bool {
        let addr = cache_ptr as usize;
        addr >= self.first_cache && addr < self.first_cache + self.cache_num * size_of::<Cache>()
    }

    /// Claims a free descriptor slot, returning uninitialized storage for
    /// the caller to write a `Cache` into.
    ///
    /// # Safety
    /// `self` must have been produced by `init_at` and not be full.
    pub unsafe fn take_slot(&mut self) -> Option<*mut Cache> {
        if self.free == FREE_END {
            return None;
        }
        let idx = self.free;
        let idx_ptr = Self::index_array_ptr(self as *mut CacheBlock);
        self.free = idx_ptr.add(idx as usize).read();
        self.inuse += 1;
        Some((self.first_cache as *mut u8).add(idx as usize * size_of::<Cache>()) as *mut Cache)
    }

    /// Returns a descriptor slot to the free list. `cache_ptr` must be a
    /// slot this block previously handed out via `take_slot`.
    ///
    /// # Safety
    /// Same requirements as `take_slot`, plus `self.owns(cache_ptr)`.
    pub unsafe fn release_slot(&mut self, cache_ptr: *mut Cache) {
        let idx = ((cache_ptr as usize - self.first_cache) / size_of::<Cache>()) as u32;
        let idx_ptr = Self::index_array_ptr(self as *mut CacheBlock);
        idx_ptr.add(idx as usize).write(self.free);
        self.free = idx;
        self.inuse -= 1;
    }

    unsafe fn is_free_index(&self, target: u32) -> bool {
        let idx_ptr = Self::index_array_ptr(self as *const CacheBlock as *mut CacheBlock);
        let mut cur = self.free;
        while cur != FREE_END {
            if cur == target {
                return true;
            }
            cur = idx_ptr.add(cur as usize).read();
        }
        false
    }

    /// Iterates every currently in-use descriptor slot. Cost is
    /// `O(cache_num)` plus `O(free-list length)` per slot, acceptable for
    /// introspection (`find_cache`) but not meant for the hot alloc path.
    ///
    /// # Safety
    /// `self` must have been produced by `init_at`.
    pub unsafe fn used_slots(&self) -> CacheBlockUsedIter<'_> {
        CacheBlockUsedIter {
            block: self,
            idx: 0,
        }
    }
}

pub struct CacheBlockUsedIter<'a> {
    block: &'a CacheBlock,
    idx: usize,
}

impl Iterator for CacheBlockUsedIter<'_> {
    type Item = *mut Cache;

    fn next(&mut self) -> Option<Self::Item> {
        unsafe {
            while self.idx < self.block.cache_num {
                let i = self.idx;
                self.idx += 1;
                if !self.block.is_free_index(i as u32) {
                    let ptr = (self.block.first_cache as *mut u8).add(i * size_of::<Cache>())
                        as *mut Cache;
                    return Some(ptr);
                }
            }
            None
        }
    }
}

/// Hand-rolled singly linked list of cache blocks, threaded through
/// `CacheBlock::next`.
pub struct CacheBlockList {
    head: Option<NonNull<CacheBlock>>,
}

impl CacheBlockList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    pub fn head(&self) -> Option<NonNull<CacheBlock>> {
        self.head
    }

    /// # Safety
    /// `block` must be valid and not already linked into any list.
    pub unsafe fn push_front(&mut self, mut block: NonNull<CacheBlock>) {
        block.as_mut().next = self.head;
        self.head = Some(block);
    }

    /// Unlinks `block` from this list. Returns whether it was found.
    ///
    /// # Safety
    /// Every block reachable from `self.head` must be valid.
    pub unsafe fn remove(&mut self, mut block: NonNull<CacheBlock>) -> bool {
        match self.head {
            Some(head) if head == block => {
                self.head = block.as_mut().next;
                true
            }
            Some(mut cur) => loop {
                match cur.as_ref().next {
                    Some(next) if next == block => {
                        cur.as_mut().next = block.as_mut().next;
                        return true;
                    }
                    Some(next) => cur = next,
                    None => return false,
                }
            },
            None => false,
        }
    }

    /// # Safety
    /// Every block reachable from `self.head` must be valid.
    pub unsafe fn find<F: Fn(&CacheBlock) -> bool>(&self, pred: F) -> Option<NonNull<CacheBlock>> {
        let mut cur = self.head;
        while let Some(node) = cur {
            if pred(node.as_ref()) {
                return Some(node);
            }
            cur = node.as_ref().next;
        }
        None
    }

    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head;
        while let Some(node) = cur {
            count += 1;
            cur = unsafe { node.as_ref().next };
        }
        count
    }
}
