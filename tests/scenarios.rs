//! Whole-allocator, black-box scenarios exercising more than one
//! operation at a time — the kind of assertion that doesn't belong inside
//! a single module's unit tests.

use kmemalloc::{Allocator, Region};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn region(num_pages: usize) -> (Box<[u8]>, Region) {
    let bytes = num_pages * kmemalloc::PAGE;
    let mem: Box<[u8]> = vec![0u8; bytes + kmemalloc::PAGE].into_boxed_slice();
    let raw = mem.as_ptr() as usize;
    let base = (raw + kmemalloc::PAGE - 1) / kmemalloc::PAGE * kmemalloc::PAGE;
    (mem, unsafe { Region::new(base, num_pages) }.unwrap())
}

/// Scenario 1: a single small kmalloc/kfree round trip leaves the
/// allocator equal to post-init except for the lazily created size class.
#[test]
fn scenario_kmalloc_round_trip_only_creates_one_size_class() {
    let (_mem, region) = region(256);
    let alloc = Allocator::init(region).unwrap();

    assert!(alloc.find_cache("64").is_none());
    let before = alloc.available_pages();

    let a = alloc.kmalloc(40).expect("kmalloc(40) should succeed");
    alloc.kfree(a);

    assert!(alloc.find_cache("64").is_some());
    // The freed slab goes empty on this first transition, which triggers
    // the sticky shrink policy's immediate reclaim, so the page borrowed
    // for it comes straight back.
    assert_eq!(alloc.available_pages(), before);
}

/// Scenario 2: allocating object_num + 1 objects from a fixed-size cache
/// forces a second slab onto partial; freeing everything in reverse order
/// drains both slabs back to empty. The sticky shrink policy reclaims each
/// as soon as it empties, so a trailing manual shrink finds nothing left.
#[test]
fn scenario_cache_overflow_creates_second_slab_then_shrinks() {
    let (_mem, region) = region(64);
    let alloc = Allocator::init(region).unwrap();
    let cache = alloc.cache_create("fixed128", 128, None, None).unwrap();
    let object_num = alloc.cache_info(cache).object_num;

    let mut objs = Vec::new();
    for _ in 0..object_num + 1 {
        objs.push(alloc.cache_alloc(cache).expect("cache_alloc should succeed"));
    }
    assert_eq!(alloc.cache_info(cache).slab_num, 2);

    for obj in objs.into_iter().rev() {
        alloc.cache_free(cache, obj).unwrap();
    }

    assert_eq!(alloc.cache_info(cache).slab_num, 0);
    assert_eq!(alloc.cache_shrink(cache), 0);
}

/// Scenario 3: an off-slab cache's first allocation lazily creates the
/// shared "off-slabs" descriptor cache, whose object size is the slab
/// descriptor's size plus 4 bytes.
#[test]
fn scenario_large_object_cache_uses_off_slab_descriptor() {
    let (_mem, region) = region(128);
    let alloc = Allocator::init(region).unwrap();
    assert!(alloc.find_cache("off-slabs").is_none());

    let cache = alloc.cache_create("big", 8192, None, None).unwrap();
    let obj = alloc.cache_alloc(cache).expect("cache_alloc should succeed");

    let off_slabs = alloc
        .find_cache("off-slabs")
        .expect("off-slabs cache should now exist");
    let info = alloc.cache_info(off_slabs);
    assert_eq!(info.object_size, kmemalloc::Slab::descriptor_size() + 4);

    alloc.cache_free(cache, obj).unwrap();
}

/// Scenario 4: once the first slab is full, repeatedly allocating and
/// freeing a single extra object forces a second slab to be grown and
/// emptied over and over. The sticky shrink flag stops that second slab
/// from ever being reclaimed after the first churn cycle, so later cycles
/// just recycle it from `empty` instead of growing a third — `slab_num`
/// never exceeds 2 across `10 * object_num` such cycles.
#[test]
fn scenario_churn_keeps_slab_num_bounded() {
    let (_mem, region) = region(64);
    let alloc = Allocator::init(region).unwrap();
    let cache = alloc.cache_create("churn64", 64, None, None).unwrap();
    let object_num = alloc.cache_info(cache).object_num;

    let mut base_fill = Vec::new();
    for _ in 0..object_num {
        base_fill.push(alloc.cache_alloc(cache).expect("base fill should succeed"));
    }
    assert_eq!(alloc.cache_info(cache).slab_num, 1);

    for _ in 0..10 * object_num {
        let extra = alloc.cache_alloc(cache).expect("extra alloc should succeed");
        assert!(alloc.cache_info(cache).slab_num <= 2);
        alloc.cache_free(cache, extra).unwrap();
        assert!(alloc.cache_info(cache).slab_num <= 2);
    }

    for obj in base_fill {
        alloc.cache_free(cache, obj).unwrap();
    }
}

/// Randomized-size coverage: kmalloc at a random power-of-two size class on
/// every iteration, keeping a handful of objects live at once, and check
/// every outstanding object still frees cleanly at the end regardless of
/// which of the thirteen size classes produced it.
#[test]
fn random_sizes_round_trip_across_size_classes() {
    let (_mem, region) = region(512);
    let alloc = Allocator::init(region).unwrap();

    let mut rng = StdRng::seed_from_u64(0x5EED_5EED);
    let mut live = Vec::new();

    for _ in 0..200 {
        if live.len() < 8 && rng.gen_bool(0.7) {
            let shift = rng.gen_range(5..=12u32);
            let size = 1usize << shift;
            if let Some(obj) = alloc.kmalloc(size) {
                live.push(obj);
            }
        } else if let Some(obj) = live.pop() {
            alloc.kfree(obj);
        }
    }

    for obj in live {
        alloc.kfree(obj);
    }
}

/// Scenario 5 (buddy_alloc(3) rounding and raw-request accounting) is
/// exercised directly against `BuddyAllocator` in `src/buddy.rs`'s own
/// `single_alloc_rounds_up_and_accounts_raw_request` test. Here we only
/// check that the same accounting holds through the full stack: `init`
/// claims exactly one page for the first cache block, and a subsequent
/// kmalloc/kfree round trip leaves `available_pages` unchanged.
#[test]
fn available_pages_accounts_through_the_full_stack() {
    let (_mem, region) = region(256);
    let alloc = Allocator::init(region).unwrap();
    assert_eq!(alloc.available_pages(), 256 - 1);

    let before = alloc.available_pages();
    let a = alloc.kmalloc(1).unwrap();
    alloc.kfree(a);
    assert_eq!(alloc.available_pages(), before);
}

/// Scenario 6: a constructor runs exactly once per slot at slab
/// construction time, never again on subsequent allocs that reuse already
/// initialized slots.
#[test]
fn scenario_constructor_runs_once_per_slot() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    fn ctor(_obj: *mut u8) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }
    fn dtor(_obj: *mut u8) {}

    let (_mem, region) = region(16);
    let alloc = Allocator::init(region).unwrap();
    let cache = alloc.cache_create("x", 64, Some(ctor), Some(dtor)).unwrap();
    let object_num = alloc.cache_info(cache).object_num;

    assert_eq!(CALLS.load(Ordering::SeqCst), object_num);

    let obj = alloc.cache_alloc(cache).unwrap();
    alloc.cache_free(cache, obj).unwrap();
    let _ = alloc.cache_alloc(cache).unwrap();

    assert_eq!(CALLS.load(Ordering::SeqCst), object_num);
}
