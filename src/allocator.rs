//! Top-level `Allocator`: the single owned value tying the buddy layer,
//! the cache-block registry, the off-slab cache and the size-class table
//! together behind one coarse lock.
//!
//! Public methods are a thin locking shell (`Allocator`); the actual logic
//! lives on `AllocatorInner` as plain `&mut self` methods with no locking of
//! their own, so internal recursive calls (e.g. `cache_create` lazily
//! creating the off-slabs cache) never re-enter the lock.

use core::ptr::NonNull;

use spin::Mutex;

use crate::buddy::BuddyAllocator;
use crate::error::{Error, Result};
use crate::kmalloc::SizeClassTable;
use crate::region::Region;
use crate::slab::cache::{Ctor, Dtor};
use crate::slab::{Cache, CacheBlock, CacheBlockList, CacheInfo, Slab};
use crate::LARGE_OBJ;

/// Opaque handle to a created cache, the Rust analogue of the reference's
/// `kmem_cache_t*`. Valid for as long as the cache has not been passed to
/// `Allocator::cache_destroy`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CacheHandle(NonNull<Cache>);

unsafe impl Send for CacheHandle {}

/// Borrows the off-slab descriptor cache, if this cache needs one.
/// Free function (not a method) so it only borrows the `off_slab_cache`
/// field, letting callers borrow other `AllocatorInner` fields (e.g.
/// `buddy`) at the same time.
pub(crate) fn off_slab_ref_for(
    off_slab_cache: &mut Option<NonNull<Cache>>,
    needs_off_slab: bool,
) -> Option<&mut Cache> {
    if needs_off_slab {
        off_slab_cache.as_mut().map(|h| unsafe { h.as_mut() })
    } else {
        None
    }
}

pub(crate) struct AllocatorInner {
    pub(crate) buddy: BuddyAllocator,
    cache_blocks: CacheBlockList,
    pub(crate) off_slab_cache: Option<NonNull<Cache>>,
    pub(crate) size_classes: SizeClassTable,
}

unsafe impl Send for AllocatorInner {}

impl AllocatorInner {
    fn new(region: Region) -> Result<Self> {
        let mut buddy = BuddyAllocator::new(region)?;
        let first_block_addr = buddy.alloc(1).ok_or(Error::OutOfMemory)?;
        let first_block = unsafe { CacheBlock::init_at(first_block_addr as *mut CacheBlock) };
        let mut cache_blocks = CacheBlockList::new();
        unsafe { cache_blocks.push_front(first_block) };

        Ok(Self {
            buddy,
            cache_blocks,
            off_slab_cache: None,
            size_classes: SizeClassTable::new(),
        })
    }

    fn ensure_off_slab_cache(&mut self) -> Result<()> {
        if self.off_slab_cache.is_some() {
            return Ok(());
        }
        let size = Slab::descriptor_size() + 4;
        let handle = self.create_cache_raw("off-slabs", size, None, None)?;
        self.off_slab_cache = Some(handle);
        Ok(())
    }

    fn claim_cache_slot(&mut self) -> Result<*mut Cache> {
        if let Some(mut block) = unsafe { self.cache_blocks.find(|b| !b.is_full()) } {
            return unsafe { block.as_mut().take_slot() }.ok_or(Error::CorruptedState);
        }

        let addr = self.buddy.alloc(1).ok_or(Error::OutOfMemory)?;
        let mut new_block = unsafe { CacheBlock::init_at(addr as *mut CacheBlock) };
        unsafe { self.cache_blocks.push_front(new_block) };
        unsafe { new_block.as_mut().take_slot() }.ok_or(Error::CorruptedState)
    }

    pub(crate) fn create_cache_raw(
        &mut self,
        name: &str,
        size: usize,
        ctor: Option<Ctor>,
        dtor: Option<Dtor>,
    ) -> Result<NonNull<Cache>> {
        if size > LARGE_OBJ {
            self.ensure_off_slab_cache()?;
        }

        let slot = self.claim_cache_slot()?;
        let off_slab_ref = off_slab_ref_for(&mut self.off_slab_cache, size > LARGE_OBJ);

        match Cache::init(name, size, ctor, dtor, &mut self.buddy, off_slab_ref) {
            Ok(cache) => {
                unsafe { slot.write(cache) };
                Ok(unsafe { NonNull::new_unchecked(slot) })
            }
            Err(e) => {
                // Roll the claimed descriptor slot back so it isn't
                // permanently lost on a failed create.
                if let Some(mut block) = unsafe { self.cache_blocks.find(|b| b.owns(slot)) } {
                    unsafe { block.as_mut().release_slot(slot) };
                }
                Err(e)
            }
        }
    }

    fn cache_alloc_raw(&mut self, mut handle: NonNull<Cache>) -> Option<usize> {
        let cache = unsafe { handle.as_mut() };
        let off_slab_ref = off_slab_ref_for(&mut self.off_slab_cache, cache.off_slab);
        cache.alloc(&mut self.buddy, off_slab_ref)
    }

    fn cache_free_raw(&mut self, mut handle: NonNull<Cache>, obj: usize) -> Result<()> {
        let cache = unsafe { handle.as_mut() };
        let off_slab_ref = off_slab_ref_for(&mut self.off_slab_cache, cache.off_slab);
        cache.free(obj, &mut self.buddy, off_slab_ref)
    }

    fn cache_shrink_raw(&mut self, mut handle: NonNull<Cache>) -> usize {
        let cache = unsafe { handle.as_mut() };
        let off_slab_ref = off_slab_ref_for(&mut self.off_slab_cache, cache.off_slab);
        cache.shrink(&mut self.buddy, off_slab_ref)
    }

    fn cache_destroy_raw(&mut self, mut handle: NonNull<Cache>) {
        let cache = unsafe { handle.as_mut() };
        let off_slab_ref = off_slab_ref_for(&mut self.off_slab_cache, cache.off_slab);
        cache.destroy(&mut self.buddy, off_slab_ref);

        let slot = handle.as_ptr();
        if let Some(mut block) = unsafe { self.cache_blocks.find(|b| b.owns(slot)) } {
            unsafe { block.as_mut().release_slot(slot) };
            if unsafe { block.as_ref().is_empty() } && self.cache_blocks.len() > 1 {
                unsafe { self.cache_blocks.remove(block) };
                self.buddy.free(block.as_ptr() as usize, 1);
            }
        }
    }

    fn find_cache_raw(&self, name: &str) -> Option<NonNull<Cache>> {
        let mut cur = self.cache_blocks.head();
        while let Some(block) = cur {
            let block_ref = unsafe { block.as_ref() };
            for cache_ptr in unsafe { block_ref.used_slots() } {
                let cache = unsafe { &*cache_ptr };
                if cache.name.as_str() == name {
                    return NonNull::new(cache_ptr);
                }
            }
            cur = block_ref.next;
        }
        None
    }
}

/// The allocator: a buddy-managed region, the cache registry layered on top
/// of it, and the size-class table, all behind one lock.
pub struct Allocator {
    inner: Mutex<AllocatorInner>,
}

impl Allocator {
    /// Registers `region` and creates the first cache block. Precondition
    /// baked into `Region::new`: `num_pages >= 1` and `base` page-aligned.
    pub fn init(region: Region) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(AllocatorInner::new(region)?),
        })
    }

    pub fn cache_create(
        &self,
        name: &str,
        size: usize,
        ctor: Option<Ctor>,
        dtor: Option<Dtor>,
    ) -> Result<CacheHandle> {
        self.inner
            .lock()
            .create_cache_raw(name, size, ctor, dtor)
            .map(CacheHandle)
    }

    pub fn cache_alloc(&self, handle: CacheHandle) -> Option<usize> {
        self.inner.lock().cache_alloc_raw(handle.0)
    }

    pub fn cache_free(&self, handle: CacheHandle, obj: usize) -> Result<()> {
        self.inner.lock().cache_free_raw(handle.0, obj)
    }

    pub fn cache_shrink(&self, handle: CacheHandle) -> usize {
        self.inner.lock().cache_shrink_raw(handle.0)
    }

    pub fn cache_destroy(&self, handle: CacheHandle) {
        self.inner.lock().cache_destroy_raw(handle.0)
    }

    pub fn cache_info(&self, handle: CacheHandle) -> CacheInfo {
        unsafe { handle.0.as_ref() }.info()
    }

    pub fn cache_error(&self, handle: CacheHandle) -> bool {
        unsafe { handle.0.as_ref() }.error()
    }

    /// Additive lookup mirroring the reference's `findCache`.
    pub fn find_cache(&self, name: &str) -> Option<CacheHandle> {
        self.inner.lock().find_cache_raw(name).map(CacheHandle)
    }

    pub fn kmalloc(&self, size: usize) -> Option<usize> {
        self.inner.lock().kmalloc_raw(size)
    }

    pub fn kfree(&self, obj: usize) {
        self.inner.lock().kfree_raw(obj)
    }

    pub fn available_pages(&self) -> usize {
        self.inner.lock().buddy.available_pages()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::PAGE;
    use std::boxed::Box;

    fn make_allocator(num_pages: usize) -> (Box<[u8]>, Allocator) {
        let bytes = num_pages * PAGE;
        let mem: Box<[u8]> = vec![0u8; bytes + PAGE].into_boxed_slice();
        let raw = mem.as_ptr() as usize;
        let base = (raw + PAGE - 1) / PAGE * PAGE;
        let region = unsafe { Region::new(base, num_pages) }.unwrap();
        (mem, Allocator::init(region).unwrap())
    }

    #[test]
    fn kmalloc_kfree_round_trip() {
        let (_mem, alloc) = make_allocator(256);
        let before = alloc.available_pages();

        let a = alloc.kmalloc(40).expect("kmalloc should succeed");
        alloc.kfree(a);

        assert!(alloc.find_cache("64").is_some());
        // First empty transition triggers the sticky shrink policy's
        // immediate reclaim, so the borrowed page comes straight back.
        assert_eq!(alloc.available_pages(), before);
    }

    #[test]
    fn cache_lifecycle_migrates_slabs_and_shrinks() {
        let (_mem, alloc) = make_allocator(64);
        let cache = alloc.cache_create("fixed128", 128, None, None).unwrap();

        let info = alloc.cache_info(cache);
        let object_num = info.object_num;

        let mut objs = std::vec::Vec::new();
        for _ in 0..object_num + 1 {
            objs.push(alloc.cache_alloc(cache).unwrap());
        }

        for obj in objs.into_iter().rev() {
            alloc.cache_free(cache, obj).unwrap();
        }

        // Both slabs already auto-reclaimed as they emptied; nothing left
        // for a trailing manual shrink to find.
        assert_eq!(alloc.cache_info(cache).slab_num, 0);
        assert_eq!(alloc.cache_shrink(cache), 0);
    }

    #[test]
    fn off_slab_cache_is_created_lazily_for_large_objects() {
        let (_mem, alloc) = make_allocator(128);
        assert!(alloc.find_cache("off-slabs").is_none());

        let cache = alloc.cache_create("big", 8192, None, None).unwrap();
        let _ = alloc.cache_alloc(cache).unwrap();

        assert!(alloc.find_cache("off-slabs").is_some());
    }

    #[test]
    fn cache_create_name_overflow_is_latched() {
        let (_mem, alloc) = make_allocator(16);
        let cache = alloc
            .cache_create("a-name-much-longer-than-nineteen-chars", 32, None, None)
            .unwrap();
        assert!(alloc.cache_error(cache));
    }
}
