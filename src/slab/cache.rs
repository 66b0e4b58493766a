//! Cache descriptor: slab lifecycle, empty/partial/full migration, colouring
//! and the sticky shrink policy.

use core::ptr::NonNull;

use crate::buddy::BuddyAllocator;
use crate::error::{Error, Result};
use crate::slab::page::{Slab, SlabList};
use crate::{FRAGM_BORDER, L1_LINE, LARGE_OBJ, PAGE};

/// Object constructor, invoked once per slot at slab construction time.
pub type Ctor = fn(*mut u8);
/// Object destructor, invoked once per slot on `cache_free`/`cache_destroy`.
pub type Dtor = fn(*mut u8);

/// Sticky shrink-policy state, replacing the reference's packed `flag`
/// bits 1/2 with named states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShrinkState {
    /// No slab has ever transitioned to empty.
    Virgin,
    /// At least one slab has gone empty; every subsequent empty transition
    /// shrinks immediately.
    HasEmptyEver,
    /// A new slab was grown after an empty transition was recorded; further
    /// frees still deposit onto `empty` but no longer auto-shrink.
    Churning,
}

/// A structured snapshot for `cache_info`, in place of the reference's
/// direct `printf` — diagnostics are the caller's concern.
#[derive(Debug, Clone)]
pub struct CacheInfo {
    pub name: heapless::String<20>,
    pub object_size: usize,
    pub total_bytes: usize,
    pub slab_num: usize,
    pub object_num: usize,
    pub usage_percent: f64,
}

/// One named object cache. Slabs are threaded through `empty`/`partial`/
/// `full` lists; `off_slab` caches store their `Slab` descriptors in a
/// separate descriptor cache rather than inline in their own pages.
pub struct Cache {
    pub name: heapless::String<20>,
    pub object_size: usize,
    pub empty: SlabList,
    pub partial: SlabList,
    pub full: SlabList,
    pub ctor: Option<Ctor>,
    pub dtor: Option<Dtor>,
    /// Rolling colour offset advanced by `L1_LINE` per new slab, wrapping
    /// at `wastage`.
    pub slab_offset: usize,
    pub wastage: usize,
    /// Pages per slab.
    pub slab_size: usize,
    pub slab_num: usize,
    pub object_num: usize,
    pub error: bool,
    pub off_slab: bool,
    pub shrink_state: ShrinkState,
}

impl Cache {
    /// Builds and fully initializes a cache, including its first (empty)
    /// slab, per the create algorithm.
    ///
    /// `off_slab_cache` must be `Some` whenever `object_size > LARGE_OBJ`;
    /// it is itself always on-slab and is never recursively off-slab.
    pub fn init(
        name: &str,
        object_size: usize,
        ctor: Option<Ctor>,
        dtor: Option<Dtor>,
        buddy: &mut BuddyAllocator,
        off_slab_cache: Option<&mut Cache>,
    ) -> Result<Cache> {
        let mut bounded_name: heapless::String<20> = heapless::String::new();
        let mut error = false;
        for (i, ch) in name.chars().enumerate() {
            if i >= 19 {
                error = true;
                break;
            }
            let _ = bounded_name.push(ch);
        }

        let off_slab = object_size > LARGE_OBJ;
        let slab_size = choose_slab_size_pages(object_size);

        let (object_num, wastage) = if off_slab {
            (slab_size * PAGE / object_size, 0)
        } else {
            let n = (slab_size * PAGE - Slab::descriptor_size()) / (object_size + 4);
            let w = slab_size * PAGE - Slab::descriptor_size() - n * (4 + object_size);
            (n, w)
        };

        if object_num == 0 {
            return Err(Error::CorruptedState);
        }
        // The off-slabs cache's own object size (sizeof(Slab) + 4) only
        // reserves room for one trailing link entry; an off-slab cache
        // whose object_num comes out above 1 would overrun adjacent
        // off-slab descriptors. This is reachable: object_size = 5461
        // converges to slab_size = 4 pages (the 4096- and 8192-byte
        // candidates both leave a remainder over FRAGM_BORDER, so the
        // doubling loop keeps going), giving object_num = 16384 / 5461 = 3.
        // A structural limit of the reference's descriptor layout, not a
        // recoverable allocation failure.
        if off_slab && object_num > 1 {
            return Err(Error::CorruptedState);
        }

        let mut cache = Cache {
            name: bounded_name,
            object_size,
            empty: SlabList::new(),
            partial: SlabList::new(),
            full: SlabList::new(),
            ctor,
            dtor,
            slab_offset: 0,
            wastage,
            slab_size,
            slab_num: 0,
            object_num,
            error,
            off_slab,
            shrink_state: ShrinkState::Virgin,
        };

        let first_slab = cache
            .grow_slab(buddy, off_slab_cache)
            .ok_or(Error::OutOfMemory)?;
        unsafe { cache.empty.push_front(first_slab) };

        Ok(cache)
    }

    /// Whether the cache's name was truncated on creation.
    pub fn error(&self) -> bool {
        self.error
    }

    pub fn usage_percent(&self) -> f64 {
        let total = self.slab_num * self.object_num;
        if total == 0 {
            return 0.0;
        }
        let mut allocated = 0usize;
        for _ in unsafe { self.full.iter() } {
            allocated += self.object_num;
        }
        for s in unsafe { self.partial.iter() } {
            allocated += unsafe { s.as_ref().num_allocated };
        }
        (allocated as f64 / total as f64) * 100.0
    }

    pub fn info(&self) -> CacheInfo {
        CacheInfo {
            name: self.name.clone(),
            object_size: self.object_size,
            total_bytes: self.slab_num * self.slab_size * PAGE,
            slab_num: self.slab_num,
            object_num: self.object_num,
            usage_percent: self.usage_percent(),
        }
    }

    /// Allocates one object, preferring `partial`, then promoting `empty`,
    /// then growing a fresh slab. Returns `None` on buddy exhaustion.
    pub fn alloc(
        &mut self,
        buddy: &mut BuddyAllocator,
        off_slab_cache: Option<&mut Cache>,
    ) -> Option<usize> {
        let slab = if let Some(s) = self.partial.head() {
            s
        } else if let Some(s) = unsafe { self.empty.pop_front() } {
            unsafe { self.partial.push_front(s) };
            s
        } else {
            let new_slab = self.grow_slab(buddy, off_slab_cache)?;
            if self.shrink_state == ShrinkState::HasEmptyEver {
                self.shrink_state = ShrinkState::Churning;
            }
            unsafe { self.partial.push_front(new_slab) };
            new_slab
        };

        let obj = unsafe { (*slab.as_ptr()).take_free_slot() };

        if unsafe { slab.as_ref().is_full() } {
            unsafe {
                self.partial.remove(slab);
                self.full.push_front(slab);
            }
        }

        Some(obj)
    }

    /// Frees `obj`, locating its owning slab by scanning `full` then
    /// `partial`. Returns `Error::InvalidFree` if no slab of this cache
    /// owns the address.
    pub fn free(
        &mut self,
        obj: usize,
        buddy: &mut BuddyAllocator,
        off_slab_cache: Option<&mut Cache>,
    ) -> Result<()> {
        let (mut slab, came_from_full) = if let Some(s) = unsafe { self.full.find(|s| s.owns(obj)) } {
            (s, true)
        } else if let Some(s) = unsafe { self.partial.find(|s| s.owns(obj)) } {
            (s, false)
        } else {
            return Err(Error::InvalidFree);
        };

        unsafe { slab.as_mut().return_slot(obj) };
        if let Some(dtor) = self.dtor {
            dtor(obj as *mut u8);
        }

        if came_from_full {
            unsafe {
                self.full.remove(slab);
                self.partial.push_front(slab);
            }
        } else if unsafe { slab.as_ref().is_empty() } {
            unsafe {
                self.partial.remove(slab);
                self.empty.push_front(slab);
            }
            if self.shrink_state == ShrinkState::Virgin {
                self.shrink_state = ShrinkState::HasEmptyEver;
            }
            if self.shrink_state != ShrinkState::Churning {
                self.shrink(buddy, off_slab_cache);
            }
        }

        Ok(())
    }

    /// Reclaims every slab on `empty` back to buddy (and, for off-slab
    /// caches, back to the off-slabs cache). Returns pages reclaimed.
    pub fn shrink(&mut self, buddy: &mut BuddyAllocator, off_slab_cache: Option<&mut Cache>) -> usize {
        let (pages, count) = Self::reclaim(&mut self.empty, self.off_slab, buddy, off_slab_cache);
        self.slab_num = self.slab_num.saturating_sub(count);
        if self.shrink_state == ShrinkState::Virgin {
            self.shrink_state = ShrinkState::HasEmptyEver;
        }
        pages
    }

    /// Reclaims every slab on all three lists. Used when the cache itself
    /// is being torn down.
    pub fn destroy(&mut self, buddy: &mut BuddyAllocator, mut off_slab_cache: Option<&mut Cache>) {
        let (_, c1) = Self::reclaim(&mut self.full, self.off_slab, buddy, off_slab_cache.as_deref_mut());
        let (_, c2) =
            Self::reclaim(&mut self.partial, self.off_slab, buddy, off_slab_cache.as_deref_mut());
        let (_, c3) = Self::reclaim(&mut self.empty, self.off_slab, buddy, off_slab_cache);
        self.slab_num = self.slab_num.saturating_sub(c1 + c2 + c3);
    }

    fn reclaim(
        list: &mut SlabList,
        off_slab: bool,
        buddy: &mut BuddyAllocator,
        mut off_slab_cache: Option<&mut Cache>,
    ) -> (usize, usize) {
        let mut pages = 0;
        let mut count = 0;
        while let Some(slab) = unsafe { list.pop_front() } {
            let slab_base = unsafe { slab.as_ref().slab_base };
            let slab_size = unsafe { slab.as_ref().slab_size_pages };
            buddy.free(slab_base, slab_size);
            if off_slab {
                if let Some(off) = off_slab_cache.as_deref_mut() {
                    let _ = off.free(slab.as_ptr() as usize, buddy, None);
                }
            }
            pages += slab_size;
            count += 1;
        }
        (pages, count)
    }

    fn next_colour_off(&mut self) -> usize {
        let off = self.slab_offset;
        if self.wastage > L1_LINE {
            if self.slab_offset + L1_LINE > self.wastage {
                self.slab_offset = 0;
            } else {
                self.slab_offset += L1_LINE;
            }
        }
        off
    }

    fn grow_slab(
        &mut self,
        buddy: &mut BuddyAllocator,
        off_slab_cache: Option<&mut Cache>,
    ) -> Option<NonNull<Slab>> {
        let colour_off = self.next_colour_off();
        let slab_base = buddy.alloc(self.slab_size)?;

        let slab_ptr: *mut Slab = if self.off_slab {
            let off = off_slab_cache.expect("off-slab caches require an off-slabs cache");
            match off.alloc(buddy, None) {
                Some(addr) => addr as *mut Slab,
                None => {
                    buddy.free(slab_base, self.slab_size);
                    return None;
                }
            }
        } else {
            slab_base as *mut Slab
        };

        let first_obj = if self.off_slab {
            slab_base + colour_off
        } else {
            slab_base + Slab::descriptor_size() + self.object_num * 4 + colour_off
        };

        let slab = unsafe {
            Slab::init_at(
                slab_ptr,
                first_obj,
                colour_off,
                self.object_num,
                self.object_size,
                slab_base,
                self.slab_size,
                self.off_slab,
            )
        };

        if let Some(ctor) = self.ctor {
            let mut slot = first_obj;
            for _ in 0..self.object_num {
                ctor(slot as *mut u8);
                slot += self.object_size;
            }
        }

        self.slab_num += 1;
        Some(slab)
    }
}

/// Chooses `slab_size` (in pages) so that internal fragmentation,
/// `slab_size * PAGE % object_size`, is at most `FRAGM_BORDER` bytes.
pub(crate) const fn choose_slab_size_pages(object_size: usize) -> usize {
    let mut pages = 1usize;
    while (pages * PAGE) % object_size > FRAGM_BORDER {
        pages *= 2;
    }
    pages
}
