//! Error kinds shared by the buddy, slab and size-class layers.

/// Failure modes exposed by the allocator's public API.
///
/// Most callers only ever see `OutOfMemory` (from `cache_alloc`/`kmalloc`
/// returning `None`) or `NameOverflow` (from `Cache::error`). The remaining
/// variants cover the invalid-free and internal-invariant paths from the
/// error design (spec section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The buddy layer has no block large enough to satisfy the request.
    OutOfMemory,
    /// `cache_free`/`kfree` was given an address that is not owned by any
    /// slab of the target cache.
    InvalidFree,
    /// A required argument was null or otherwise missing.
    NullArgument,
    /// The cache name did not fit in the bounded name buffer; the cache is
    /// still usable, this is latched on `Cache::error` rather than fatal.
    NameOverflow,
    /// A structural invariant (missing buddy region, corrupted free list,
    /// slab bookkeeping inconsistency) was violated. Reaching this means a
    /// caller broke the contract of an `unsafe` constructor elsewhere, or
    /// there is a bug in this crate.
    CorruptedState,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "allocator out of memory"),
            Error::InvalidFree => write!(f, "address does not belong to any slab of this cache"),
            Error::NullArgument => write!(f, "null or missing argument"),
            Error::NameOverflow => write!(f, "cache name truncated to fit the name buffer"),
            Error::CorruptedState => write!(f, "internal allocator invariant violated"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
