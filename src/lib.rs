#![cfg_attr(feature = "no_std", no_std)]
//! `kmemalloc`: a two-tier buddy/slab in-process memory allocator over a
//! caller-supplied region.
//!
//! The buddy layer ([`buddy`]) manages pages; the slab layer ([`slab`])
//! carves buddy pages into fixed-size object caches with empty/partial/full
//! migration and off-slab descriptors for large objects; [`kmalloc`] sits on
//! top as a thirteen-size-class `malloc`/`free` surface. [`Allocator`] is the
//! single owned value tying the three together behind one lock.

pub mod allocator;
pub mod buddy;
pub mod error;
pub mod kmalloc;
pub mod region;
pub mod slab;

pub use allocator::{Allocator, CacheHandle};
pub use error::{Error, Result};
pub use region::Region;
pub use slab::{CacheInfo, Ctor, Dtor, ShrinkState, Slab};

/// Bytes per page managed by the buddy layer.
pub const PAGE: usize = 4096;

/// Internal fragmentation bound used when choosing a cache's `slab_size`.
pub const FRAGM_BORDER: usize = 512;

/// Objects larger than this are stored off-slab (descriptor lives in the
/// dedicated `"off-slabs"` cache rather than inside the slab's own pages).
pub const LARGE_OBJ: usize = 4030;

/// Conventional cache-line size used to space slab colouring offsets.
pub const L1_LINE: usize = 64;

/// Sentinel terminating an intra-slab (or intra-cache-block) index free
/// list. Any value `>= max object_num` works; this crate uses the spec's own
/// constant for bit-for-bit parity with the reference.
pub const FREE_END: u32 = 4096;

/// Smallest and largest size classes behind [`kmalloc`]: `2^5` .. `2^17`.
pub const SIZE_CLASS_MIN_SHIFT: u32 = 5;
pub const SIZE_CLASS_MAX_SHIFT: u32 = 17;
pub const NUM_SIZE_CLASSES: usize = (SIZE_CLASS_MAX_SHIFT - SIZE_CLASS_MIN_SHIFT + 1) as usize;

/// `object_num` for the smallest size class, the size class with the most
/// slots per slab and therefore the widest index free list any `FREE_END`
/// sentinel has to clear.
const MIN_SIZE_CLASS_SLAB_PAGES: usize =
    slab::cache::choose_slab_size_pages(1 << SIZE_CLASS_MIN_SHIFT);
const MIN_SIZE_CLASS_OBJECT_NUM: usize =
    (MIN_SIZE_CLASS_SLAB_PAGES * PAGE) / (1 << SIZE_CLASS_MIN_SHIFT);

// The off-slabs cache's own object size (see `Allocator::ensure_off_slab_cache`)
// must itself stay under `LARGE_OBJ`, or it would need to be off-slab itself —
// `Cache::init`'s off-slab path assumes an off-slabs cache always exists on-slab.
static_assertions::const_assert!(slab::Slab::descriptor_size() + 4 < LARGE_OBJ);
// `FREE_END` terminates every intra-slab and intra-cache-block index free
// list; it must exceed any real slot index those lists can produce.
static_assertions::const_assert!(FREE_END as usize > slab::CacheBlock::calc_num_caches());
static_assertions::const_assert!(FREE_END as usize > MIN_SIZE_CLASS_OBJECT_NUM);
