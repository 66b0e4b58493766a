//! Slab engine: per-object caches (`cache`), the slab descriptor and its
//! intra-slab free-slot bookkeeping (`page`), and the registry of cache
//! descriptors (`cache_block`).

pub mod cache;
pub mod cache_block;
pub mod page;

pub use cache::{Cache, CacheInfo, Ctor, Dtor, ShrinkState};
pub use cache_block::{CacheBlock, CacheBlockList};
pub use page::{Slab, SlabList};
