#![no_main]
use std::ptr::NonNull;

use arbitrary::Arbitrary;
use headerless_alloc::{HeaderlessAllocator, MIN_ALIGNMENT, MIN_VALID_SIZE};
use libfuzzer_sys::fuzz_target;

const MAX_GRANULES: usize = 256;

#[derive(Clone, Debug, Arbitrary)]
enum AllocatorOp {
    Allocate { granules: u16 },
    Deallocate { index: u16 },
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    pool_granules: u8,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let pool_size = (usize::from(args.pool_granules) + 1) * MIN_VALID_SIZE;

    let mut heap = match HeaderlessAllocator::try_new(pool_size) {
        Ok(h) => h,
        Err(_) => return,
    };

    let mut live: Vec<(NonNull<[u8]>, u8)> = Vec::new();

    for (id, op) in args.ops.into_iter().enumerate() {
        let tag = id as u8;

        match op {
            AllocatorOp::Allocate { granules } => {
                let size = MIN_VALID_SIZE + (usize::from(granules) % MAX_GRANULES) * MIN_ALIGNMENT;
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

                let (ptr, tag) = live.swap_remove(usize::from(index) % live.len());
                assert!(unsafe { verify_paint(ptr, tag) }, "allocation was overwritten");

                unsafe { heap.deallocate(ptr.cast(), ptr.len()) };
            }
        }

        heap.validate();
    }

    for (ptr, tag) in live.drain(..) {
        assert!(unsafe { verify_paint(ptr, tag) }, "allocation was overwritten");
        unsafe { heap.deallocate(ptr.cast(), ptr.len()) };
    }
    heap.validate();

    // with everything freed, eager coalescing leaves at most one block
    assert!(heap.free_blocks() <= 1);
});

/// # Safety
///
/// `ptr` must denote a block currently allocated by the allocator under test.
unsafe fn paint(ptr: NonNull<[u8]>, value: u8) {
    let buf: &mut [u8] = unsafe { std::slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) };
    buf.fill(value);
}

/// # Safety
///
/// `ptr` must denote a block currently allocated by the allocator under test.
unsafe fn verify_paint(ptr: NonNull<[u8]>, value: u8) -> bool {
    let buf: &[u8] = unsafe { std::slice::from_raw_parts(ptr.cast().as_ptr(), ptr.len()) };
    buf.iter().all(|&byte| byte == value)
}
