//! Buddy allocator behavior, ported from `examples/original_source/tests/buddy_alloc_test.c`'s
//! `basicTest`/`basicTest2`/`extensiveTest`.

use fml::alloc::BuddyAllocator;

#[test]
fn alloc_free_returns_live_count_to_baseline() {
    let mut alloc = BuddyAllocator::new(1024 * 1024);
    let baseline = alloc.live_blocks();

    let a = alloc.alloc(128).expect("arena has room");
    let b = alloc.alloc(256).expect("arena has room");
    assert_eq!(alloc.live_blocks(), baseline + 2);

    assert!(alloc.free(a));
    assert!(alloc.free(b));
    assert_eq!(alloc.live_blocks(), baseline);
}

#[test]
fn freeing_a_bogus_pointer_is_rejected_without_corruption() {
    let mut alloc = BuddyAllocator::new(1024 * 1024);
    let a = alloc.alloc(64).expect("arena has room");
    let mid = unsafe { std::ptr::NonNull::new_unchecked(a.as_ptr().add(3)) };

    assert!(!alloc.free(mid));
    // the real block is still intact and frees cleanly afterwards
    assert!(alloc.free(a));
}

#[test]
fn alloc_result_is_at_least_the_requested_size() {
    let mut alloc = BuddyAllocator::new(1024 * 1024);
    let ptr = alloc.alloc(100).expect("arena has room");
    unsafe {
        std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 100);
    }
    assert!(alloc.free(ptr));
}

#[test]
fn calloc_zeroes_the_block() {
    let mut alloc = BuddyAllocator::new(1024 * 1024);
    let ptr = alloc.calloc(200).expect("arena has room");
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 200) };
    assert!(bytes.iter().all(|&b| b == 0));
    assert!(alloc.free(ptr));
}

#[test]
fn realloc_preserves_contents_up_to_the_smaller_size() {
    let mut alloc = BuddyAllocator::new(1024 * 1024);
    let ptr = alloc.alloc(32).expect("arena has room");
    unsafe {
        std::ptr::copy_nonoverlapping(b"hello world".as_ptr(), ptr.as_ptr(), 11);
    }
    let grown = alloc.realloc(ptr, 256).expect("arena has room");
    let bytes = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 11) };
    assert_eq!(bytes, b"hello world");
    assert!(alloc.free(grown));
}

#[test]
fn buddies_coalesce_back_into_the_original_block() {
    let mut alloc = BuddyAllocator::new(1024 * 1024);
    let baseline = alloc.live_blocks();
    let a = alloc.alloc(64).expect("room");
    let b = alloc.alloc(64).expect("room");
    assert!(alloc.free(a));
    assert!(alloc.free(b));
    assert_eq!(alloc.live_blocks(), baseline);

    // if the pair coalesced, the arena can still satisfy a single larger request that needs
    // both of their combined space plus headroom already freed elsewhere
    let big = alloc.alloc(1024).expect("coalesced space should be reusable");
    assert!(alloc.free(big));
}

#[test]
fn ten_thousand_same_size_alloc_free_cycles_return_to_zero() {
    let mut alloc = BuddyAllocator::new(1024 * 1024);
    let baseline = alloc.live_blocks();
    for i in 0..10_000u32 {
        let ptr = alloc.alloc(48).expect("arena has room for one live block at a time");
        unsafe {
            std::ptr::write_unaligned(ptr.as_ptr().cast::<u32>(), i);
        }
        let value = unsafe { std::ptr::read_unaligned(ptr.as_ptr().cast::<u32>()) };
        assert_eq!(value, i);
        assert!(alloc.free(ptr));
    }
    assert_eq!(alloc.live_blocks(), baseline);
}

#[test]
fn allocation_failure_is_none_not_a_panic() {
    let mut alloc = BuddyAllocator::new(4096);
    let mut blocks = Vec::new();
    while let Some(p) = alloc.alloc(64) {
        blocks.push(p);
    }
    assert!(alloc.alloc(64).is_none());
    for p in blocks {
        assert!(alloc.free(p));
    }
}
