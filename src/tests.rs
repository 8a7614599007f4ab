extern crate std;

use core::{ptr::NonNull, slice};
use std::prelude::rust_2021::*;

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{HeaderlessAllocator, MIN_ALIGNMENT, MIN_VALID_SIZE};

#[cfg(not(feature = "unstable"))]
use crate::Global;

#[cfg(feature = "unstable")]
use alloc::alloc::Global;

const POOL_SIZE: usize = 4096;

/// Fills the block with `value` so later probes of this memory cannot
/// mistake it for a boundary tag, and so overwrites are detectable.
///
/// # Safety
///
/// `ptr` must denote a block currently allocated by the allocator under test.
unsafe fn paint(ptr: NonNull<[u8]>, value: u8) {
    let buf: &mut [u8] = unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) };
    buf.fill(value);
}

/// # Safety
///
/// `ptr` must denote a block currently allocated by the allocator under test.
unsafe fn verify_paint(ptr: NonNull<[u8]>, value: u8) -> bool {
    let buf: &[u8] = unsafe { slice::from_raw_parts(ptr.cast().as_ptr(), ptr.len()) };
    buf.iter().all(|&byte| byte == value)
}

enum AllocatorOpTag {
    Allocate,
    Deallocate,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a block of `MIN_VALID_SIZE + granules * MIN_ALIGNMENT` bytes.
    Allocate { granules: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Deallocate { index: usize },
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Deallocate])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                granules: usize::arbitrary(g) % 64,
            },
            AllocatorOpTag::Deallocate => AllocatorOp::Deallocate {
                index: usize::arbitrary(g),
            },
        }
    }
}

#[test]
fn random_op_sequences_preserve_invariants() {
    fn prop(ops: Vec<AllocatorOp>) -> bool {
        let mut heap = HeaderlessAllocator::try_new(16 * 1024).unwrap();
        let mut live: Vec<(NonNull<[u8]>, u8)> = Vec::new();

        for (id, op) in ops.into_iter().enumerate() {
            let tag = id as u8;

            match op {
                AllocatorOp::Allocate { granules } => {
                    let size = MIN_VALID_SIZE + granules * MIN_ALIGNMENT;
                    let ptr = match heap.allocate(size) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    unsafe { paint(ptr, tag) };
                    live.push((ptr, tag));
                }

                AllocatorOp::Deallocate { index } => {
                    if live.is_empty() {
                        continue;
                    }

                    let (ptr, tag) = live.swap_remove(index % live.len());
                    if !unsafe { verify_paint(ptr, tag) } {
                        return false;
                    }

                    unsafe { heap.deallocate(ptr.cast(), ptr.len()) };
                }
            }

            heap.validate();
        }

        for (ptr, tag) in live.drain(..) {
            if !unsafe { verify_paint(ptr, tag) } {
                return false;
            }
            unsafe { heap.deallocate(ptr.cast(), ptr.len()) };
        }
        heap.validate();

        // with everything freed, eager coalescing leaves at most one block
        heap.free_blocks() <= 1
    }

    let mut qc = QuickCheck::new();
    qc.quickcheck(prop as fn(_) -> bool);
}

#[test]
fn create_and_destroy() {
    let heap = HeaderlessAllocator::try_new(POOL_SIZE).unwrap();
    drop(heap);
}

#[test]
fn immediate_reuse_after_coalesce() {
    let mut heap = HeaderlessAllocator::try_new(POOL_SIZE).unwrap();

    let p0 = heap.allocate(64).unwrap();
    unsafe { paint(p0, 0xA0) };
    unsafe { heap.deallocate(p0.cast(), p0.len()) };

    let p1 = heap.allocate(64).unwrap();
    assert_eq!(p1.cast::<u8>(), p0.cast::<u8>());
    assert_eq!(heap.free_blocks(), 0);
}

#[test]
fn triple_coalesce() {
    let mut heap = HeaderlessAllocator::try_new(POOL_SIZE).unwrap();

    let a = heap.allocate(128).unwrap();
    let b = heap.allocate(128).unwrap();
    let c = heap.allocate(128).unwrap();
    unsafe {
        paint(a, 0xAA);
        paint(b, 0xBB);
        paint(c, 0xCC);
    }

    unsafe { heap.deallocate(a.cast(), 128) };
    unsafe { heap.deallocate(c.cast(), 128) };
    assert_eq!(heap.free_blocks(), 2);

    // freeing the middle block merges all three
    unsafe { heap.deallocate(b.cast(), 128) };
    assert_eq!(heap.free_blocks(), 1);
    assert_eq!(heap.free_bytes(), 384);
}

#[test]
fn split_returns_head_and_tracks_tail() {
    let mut heap = HeaderlessAllocator::try_new(POOL_SIZE).unwrap();

    let a = heap.allocate(256).unwrap();
    unsafe { paint(a, 0x11) };
    unsafe { heap.deallocate(a.cast(), 256) };

    let p = heap.allocate(64).unwrap();
    assert_eq!(p.cast::<u8>(), a.cast::<u8>());
    assert_eq!(p.len(), 64);
    assert_eq!(heap.free_blocks(), 1);
    assert_eq!(heap.free_bytes(), 192);

    // the tracked tail begins right after the returned head
    let tail = heap.allocate(192).unwrap();
    assert_eq!(tail.cast::<u8>().as_ptr(), unsafe {
        p.cast::<u8>().as_ptr().add(64)
    });
}

#[test]
fn split_then_coalesce_round_trip() {
    let mut heap = HeaderlessAllocator::try_new(POOL_SIZE).unwrap();
    let (s, t) = (64, 128);

    let whole = heap.allocate(s + t).unwrap();
    unsafe { paint(whole, 0x22) };
    unsafe { heap.deallocate(whole.cast(), s + t) };
    assert_eq!(heap.free_blocks(), 1);
    assert_eq!(heap.free_bytes(), s + t);

    let p = heap.allocate(s).unwrap();
    assert_eq!(p.len(), s);
    assert_eq!(heap.free_blocks(), 1);
    assert_eq!(heap.free_bytes(), t);

    unsafe { heap.deallocate(p.cast(), p.len()) };
    assert_eq!(heap.free_blocks(), 1);
    assert_eq!(heap.free_bytes(), s + t);
}

#[test]
fn exhaustion_returns_error() {
    let mut heap = HeaderlessAllocator::try_new(POOL_SIZE).unwrap();

    let mut first: Option<*mut u8> = None;
    let mut total = 0;
    while let Ok(p) = heap.allocate(256) {
        let raw = p.cast::<u8>().as_ptr();
        let base = *first.get_or_insert(raw);

        // every block must lie within the pool
        assert!(raw >= base);
        assert!(unsafe { raw.add(256) } <= unsafe { base.add(POOL_SIZE) });

        total += 256;
        assert!(total <= POOL_SIZE);
    }

    assert_eq!(total, POOL_SIZE);
    heap.allocate(256).unwrap_err();
}

#[test]
fn reset_returns_pool_to_empty() {
    let mut heap = HeaderlessAllocator::try_new(POOL_SIZE).unwrap();

    let p = heap.allocate(64).unwrap();
    let base = p.cast::<u8>();
    unsafe { heap.reset() };

    assert_eq!(heap.free_blocks(), 0);
    assert_eq!(heap.free_bytes(), 0);

    // the bump pointer is back at zero, so a fresh allocation lands on the base
    let q = heap.allocate(64).unwrap();
    assert_eq!(q.cast::<u8>(), base);
}

#[test]
fn reset_is_idempotent() {
    let mut heap = HeaderlessAllocator::try_new(POOL_SIZE).unwrap();

    let p = heap.allocate(128).unwrap();
    let base = p.cast::<u8>();
    unsafe { heap.deallocate(p.cast(), p.len()) };

    unsafe { heap.reset() };
    unsafe { heap.reset() };

    assert_eq!(heap.free_blocks(), 0);
    assert_eq!(heap.free_bytes(), 0);
    assert_eq!(heap.allocate(128).unwrap().cast::<u8>(), base);
}

#[test]
fn validate_is_pure() {
    let mut heap = HeaderlessAllocator::try_new(POOL_SIZE).unwrap();

    let a = heap.allocate(128).unwrap();
    let b = heap.allocate(64).unwrap();
    unsafe {
        paint(a, 0x33);
        paint(b, 0x44);
    }
    unsafe { heap.deallocate(a.cast(), a.len()) };

    let before = (heap.free_blocks(), heap.free_bytes());
    heap.validate();
    heap.validate();
    assert_eq!((heap.free_blocks(), heap.free_bytes()), before);
}

#[test]
fn sub_minimum_leftover_is_absorbed() {
    let mut heap = HeaderlessAllocator::try_new(POOL_SIZE).unwrap();
    let odd_size = MIN_VALID_SIZE + MIN_ALIGNMENT;

    let p = heap.allocate(odd_size).unwrap();
    assert_eq!(p.len(), odd_size);
    unsafe { paint(p, 0x5A) };
    unsafe { heap.deallocate(p.cast(), p.len()) };
    assert_eq!(heap.free_blocks(), 1);

    // a split would leave a tail one granule long, too small to carry tags,
    // so the whole block comes back and nothing is left tracked
    let q = heap.allocate(MIN_VALID_SIZE).unwrap();
    assert_eq!(q.cast::<u8>(), p.cast::<u8>());
    assert_eq!(q.len(), odd_size);
    assert_eq!(heap.free_blocks(), 0);
}

#[test]
fn minimum_size_allocation_leaves_no_leftover() {
    let mut heap = HeaderlessAllocator::try_new(POOL_SIZE).unwrap();

    let p = heap.allocate(MIN_VALID_SIZE).unwrap();
    unsafe { paint(p, 0x66) };
    unsafe { heap.deallocate(p.cast(), p.len()) };
    assert_eq!(heap.free_blocks(), 1);

    let q = heap.allocate(MIN_VALID_SIZE).unwrap();
    assert_eq!(q.cast::<u8>(), p.cast::<u8>());
    assert_eq!(q.len(), MIN_VALID_SIZE);
    assert_eq!(heap.free_blocks(), 0);
}

#[test]
fn coalesce_probes_stop_at_pool_boundaries() {
    let mut heap = HeaderlessAllocator::try_new(128).unwrap();

    // the block spans the whole committed pool, so both neighbor probes hit
    // the boundary cases
    let p = heap.allocate(128).unwrap();
    unsafe { paint(p, 0x77) };
    unsafe { heap.deallocate(p.cast(), 128) };

    assert_eq!(heap.free_blocks(), 1);
    assert_eq!(heap.free_bytes(), 128);
}

#[test]
fn zero_capacity_is_rejected() {
    HeaderlessAllocator::try_new(0).unwrap_err();
}

#[test]
fn unaligned_capacity_is_rejected() {
    HeaderlessAllocator::try_new(1000).unwrap_err();
}

#[test]
fn region_layout_requirements() {
    let layout = HeaderlessAllocator::<Global>::region_layout(POOL_SIZE).unwrap();
    assert_eq!(layout.size(), POOL_SIZE);
    assert_eq!(layout.align(), MIN_ALIGNMENT);
}

#[test]
fn unaligned_region_is_rejected() {
    #[repr(align(16))]
    struct PoolStorage([u8; 64]);

    let mut storage = PoolStorage([0; 64]);
    let region = NonNull::new(unsafe { storage.0.as_mut_ptr().add(8) }).unwrap();
    unsafe { HeaderlessAllocator::new_raw(region, 16) }.unwrap_err();
}

#[test]
fn raw_constructor_round_trip() {
    #[repr(align(16))]
    struct PoolStorage([u8; 1024]);

    let storage = Box::into_raw(Box::new(PoolStorage([0; 1024])));

    let region = NonNull::new(storage.cast::<u8>()).unwrap();
    let mut heap = unsafe { HeaderlessAllocator::new_raw(region, 1024) }.unwrap();

    let p = heap.allocate(64).unwrap();
    unsafe { paint(p, 0x88) };
    unsafe { heap.deallocate(p.cast(), p.len()) };

    let region = unsafe { heap.into_raw_parts() };
    assert_eq!(region.as_ptr(), storage.cast::<u8>());

    drop(unsafe { Box::from_raw(storage) });
}

#[cfg(debug_assertions)]
#[test]
#[should_panic]
fn invalid_allocation_size_asserts() {
    let mut heap = HeaderlessAllocator::try_new(POOL_SIZE).unwrap();
    let _ = heap.allocate(MIN_ALIGNMENT);
}
