//! The headerless allocator.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                  |
//! |--------------------------|-----------|-----------------------------|
//! | Allocate                 | O(1)      | O(blocks in fitting class)  |
//! | Deallocate               | O(1)      | O(blocks in affected class) |
//! | Reset                    | O(1)      | O(1)                        |
//!
//! #### Fragmentation
//!
//! Free blocks coalesce with free neighbors the moment they are created, so
//! external fragmentation is bounded by the allocation pattern itself.
//! Internal fragmentation arises only when a split would leave a tail too
//! small to hold boundary tags; such tails are bundled into the returned
//! allocation and reported through the returned slice length.

use core::{fmt, mem};

use crate::{
    base::{is_valid_size, MIN_ALIGNMENT},
    core::{
        alloc::{AllocError, Layout},
        num::NonZeroUsize,
        ptr::NonNull,
    },
    freelist::SegregatedRangeLists,
    pool::Pool,
    tags::BoundaryTagManager,
    AllocInitError, BackingAllocator, Raw, SANITY_CHECKS,
};

#[cfg(feature = "unstable")]
use crate::core::alloc::Allocator;

#[cfg(not(feature = "unstable"))]
use crate::core::ptr::NonNullStrict;

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// Tallies derived from the allocate/deallocate stream alone.
///
/// This is the third independent witness of free-block counts, next to the
/// segregated lists and the boundary-tag manager. It must not be computed
/// from either of them.
struct Stats {
    total_allocated_blocks: usize,
    total_allocated_bytes: usize,
    total_deallocated_blocks: usize,
    total_deallocated_bytes: usize,
    current_extant_blocks: usize,
    current_extant_bytes: usize,
    current_free_blocks: usize,
    current_free_bytes: usize,
}

impl Stats {
    fn new() -> Stats {
        Stats {
            total_allocated_blocks: 0,
            total_allocated_bytes: 0,
            total_deallocated_blocks: 0,
            total_deallocated_bytes: 0,
            current_extant_blocks: 0,
            current_extant_bytes: 0,
            current_free_blocks: 0,
            current_free_bytes: 0,
        }
    }

    fn on_reset(&mut self) {
        *self = Stats::new();
    }

    fn on_allocate(&mut self, size: usize) {
        self.total_allocated_blocks += 1;
        self.total_allocated_bytes += size;

        self.current_extant_blocks += 1;
        self.current_extant_bytes += size;
    }

    fn on_deallocate(&mut self, size: usize) {
        self.total_deallocated_blocks += 1;
        self.total_deallocated_bytes += size;
        debug_assert!(self.total_deallocated_blocks <= self.total_allocated_blocks);
        debug_assert!(self.total_deallocated_bytes <= self.total_allocated_bytes);

        debug_assert!(self.current_extant_blocks != 0);
        debug_assert!(self.current_extant_bytes >= size);
        self.current_extant_blocks -= 1;
        self.current_extant_bytes -= size;
    }

    fn on_add_to_freelist(&mut self, size: usize) {
        self.current_free_blocks += 1;
        self.current_free_bytes += size;
    }

    fn on_remove_from_freelist(&mut self, size: usize) {
        debug_assert!(self.current_free_blocks != 0);
        debug_assert!(self.current_free_bytes >= size);
        self.current_free_blocks -= 1;
        self.current_free_bytes -= size;
    }

    fn validate(&self) {
        if !SANITY_CHECKS {
            return;
        }

        assert!(self.total_deallocated_blocks <= self.total_allocated_blocks);
        assert!(self.total_deallocated_bytes <= self.total_allocated_bytes);

        assert!(
            self.current_extant_blocks
                == self.total_allocated_blocks - self.total_deallocated_blocks
        );
        assert!(
            self.current_extant_bytes == self.total_allocated_bytes - self.total_deallocated_bytes
        );
    }

    fn free_blocks(&self) -> usize {
        self.current_free_blocks
    }

    fn free_bytes(&self) -> usize {
        self.current_free_bytes
    }
}

fn assert_all_equal(x1: usize, x2: usize, x3: usize) {
    assert!(x1 == x2 && x2 == x3);
}

/// A headerless pool-based heap allocator.
///
/// Blocks are carved out of a single fixed-capacity contiguous pool.
/// Allocated blocks contain user data only; the allocator writes metadata
/// exclusively into memory that is currently free, which is possible because
/// the caller supplies the size of every block it deallocates.
pub struct HeaderlessAllocator<A: BackingAllocator> {
    pool: Pool,
    ranges: SegregatedRangeLists,
    tags: BoundaryTagManager,
    stats: Stats,
    layout: Layout,
    backing_allocator: A,
}

impl HeaderlessAllocator<Raw> {
    /// Constructs a new `HeaderlessAllocator` from a raw pointer.
    ///
    /// # Errors
    ///
    /// Returns an error if `pool_size` is zero or not a multiple of
    /// [`MIN_ALIGNMENT`], if `region` is insufficiently aligned, or if
    /// `region + pool_size` would overflow.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `pool_size` bytes for
    /// the lifetime of the returned allocator.
    ///
    /// [`MIN_ALIGNMENT`]: crate::MIN_ALIGNMENT
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        pool_size: usize,
    ) -> Result<HeaderlessAllocator<Raw>, AllocInitError> {
        unsafe {
            RawHeaderlessAllocator::try_new(region, pool_size)
                .map(|r| r.with_backing_allocator(Raw))
        }
    }

    /// Decomposes the allocator into the pointer to its pool region.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is
    /// called; the returned pointer becomes the sole owner of the region that
    /// was used to construct the allocator. As such, all allocations made
    /// from this allocator should be either freed or forgotten before calling
    /// this method.
    pub unsafe fn into_raw_parts(self) -> NonNull<u8> {
        let this = mem::ManuallyDrop::new(self);
        this.pool.base().ptr()
    }
}

#[cfg(all(any(feature = "alloc", test), not(feature = "unstable")))]
impl HeaderlessAllocator<Global> {
    /// Attempts to construct a new `HeaderlessAllocator` backed by the global
    /// allocator.
    ///
    /// In particular, the pool managed by this allocator is allocated from
    /// the global allocator with a capacity of `pool_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `pool_size` is zero or not a multiple of
    /// [`MIN_ALIGNMENT`], or if sufficient memory could not be allocated from
    /// the global allocator.
    ///
    /// [`MIN_ALIGNMENT`]: crate::MIN_ALIGNMENT
    pub fn try_new(pool_size: usize) -> Result<HeaderlessAllocator<Global>, AllocInitError> {
        let layout = Self::region_layout(pool_size)?;

        unsafe {
            let region_raw = alloc::alloc::alloc(layout);
            let region_ptr = NonNull::new(region_raw).ok_or(AllocInitError::AllocFailed(layout))?;

            match RawHeaderlessAllocator::try_new(region_ptr, pool_size) {
                Ok(r) => Ok(r.with_backing_allocator(Global)),
                Err(e) => {
                    alloc::alloc::dealloc(region_ptr.as_ptr(), layout);
                    Err(e)
                }
            }
        }
    }
}

#[cfg(all(any(feature = "alloc", test), feature = "unstable"))]
impl HeaderlessAllocator<Global> {
    /// Attempts to construct a new `HeaderlessAllocator` backed by the global
    /// allocator.
    ///
    /// In particular, the pool managed by this allocator is allocated from
    /// the global allocator with a capacity of `pool_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `pool_size` is zero or not a multiple of
    /// [`MIN_ALIGNMENT`], or if sufficient memory could not be allocated from
    /// the global allocator.
    ///
    /// [`MIN_ALIGNMENT`]: crate::MIN_ALIGNMENT
    pub fn try_new(pool_size: usize) -> Result<HeaderlessAllocator<Global>, AllocInitError> {
        Self::try_new_in(pool_size, Global)
    }
}

#[cfg(feature = "unstable")]
impl<A> HeaderlessAllocator<A>
where
    A: Allocator,
{
    /// Attempts to construct a new `HeaderlessAllocator` backed by
    /// `backing_allocator`.
    ///
    /// In particular, the pool managed by this allocator is allocated from
    /// `backing_allocator` with a capacity of `pool_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `pool_size` is zero or not a multiple of
    /// [`MIN_ALIGNMENT`], or if sufficient memory could not be allocated from
    /// `backing_allocator`.
    ///
    /// [`MIN_ALIGNMENT`]: crate::MIN_ALIGNMENT
    pub fn try_new_in(
        pool_size: usize,
        backing_allocator: A,
    ) -> Result<HeaderlessAllocator<A>, AllocInitError> {
        let layout = Self::region_layout(pool_size)?;

        unsafe {
            let region_ptr = backing_allocator
                .allocate(layout)
                .map_err(|_| AllocInitError::AllocFailed(layout))?;

            match RawHeaderlessAllocator::try_new(region_ptr.cast(), pool_size) {
                Ok(r) => Ok(r.with_backing_allocator(backing_allocator)),
                Err(e) => {
                    backing_allocator.deallocate(region_ptr.cast(), layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A: BackingAllocator> HeaderlessAllocator<A> {
    /// Returns the layout requirements of the pool region managed by an
    /// allocator of capacity `pool_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if `pool_size` is zero or not a multiple of
    /// [`MIN_ALIGNMENT`].
    ///
    /// [`MIN_ALIGNMENT`]: crate::MIN_ALIGNMENT
    pub fn region_layout(pool_size: usize) -> Result<Layout, AllocInitError> {
        if pool_size == 0 || pool_size % MIN_ALIGNMENT != 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        Layout::from_size_align(pool_size, MIN_ALIGNMENT)
            .map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// `size` must satisfy [`is_valid_size`]: at least [`MIN_VALID_SIZE`]
    /// bytes and a multiple of [`MIN_ALIGNMENT`].
    ///
    /// The length of the returned slice is the true length of the block,
    /// which may exceed `size` when a split leaves a tail too small to track.
    /// That length is the size that must later be passed to
    /// [`deallocate`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if neither the free structure nor the unused tail of the
    /// pool can accommodate `size` bytes.
    ///
    /// [`is_valid_size`]: crate::is_valid_size
    /// [`MIN_VALID_SIZE`]: crate::MIN_VALID_SIZE
    /// [`MIN_ALIGNMENT`]: crate::MIN_ALIGNMENT
    /// [`deallocate`]: HeaderlessAllocator::deallocate
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(is_valid_size(size));
        self.validate();

        let (addr, len) = match unsafe { self.take_and_split_free_block(size) } {
            Some(hit) => hit,
            // the caller routinely probes for fit, so exhaustion of both the
            // free structure and the bump region is a plain error
            None => match self.pool.alloc(size) {
                Some(addr) => (addr, size),
                None => return Err(AllocError),
            },
        };

        // statistics must not move when allocation fails
        self.stats.on_allocate(len);

        self.validate();
        Ok(self.pool.base().with_addr_and_size(addr, len))
    }

    /// Deallocates the block of `size` bytes at `ptr`, coalescing it with
    /// any free neighbor on either side.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this allocator, and
    /// `size` must be the length of the slice that was returned when it was
    /// allocated.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        debug_assert_eq!(ptr.addr().get() % MIN_ALIGNMENT, 0);
        debug_assert!(is_valid_size(size));
        debug_assert!(self.pool.contains_addr(ptr.addr()));
        debug_assert!(self.pool.contains_addr(
            ptr.addr()
                .checked_add(size - 1)
                .expect("block end overflows usize")
        ));

        self.validate();

        self.stats.on_deallocate(size);
        let (addr, size) = unsafe { self.coalesce(ptr.addr(), size) };
        unsafe { self.add_to_freelist(addr, size) };

        self.validate();
    }

    /// Releases the pool back to empty and clears all free structures and
    /// statistics.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - No references to data allocated by this allocator may exist when the
    ///   method is called.
    /// - Any pointers to data previously allocated by this allocator may no
    ///   longer be dereferenced or passed to
    ///   [`deallocate`](HeaderlessAllocator::deallocate).
    pub unsafe fn reset(&mut self) {
        self.pool.free_all();
        self.ranges.reset();
        self.tags.reset();
        self.stats.on_reset();

        self.validate();
    }

    /// Cross-checks every invariant the allocator maintains.
    ///
    /// The three independent tallies of free blocks and free bytes must
    /// agree, the range lists must be well formed in both directions, and
    /// every tracked block must carry matching boundary tags.
    ///
    /// # Panics
    ///
    /// Panics if any invariant does not hold. In builds without debug
    /// assertions the checks are compiled out and this method does nothing.
    pub fn validate(&self) {
        if !SANITY_CHECKS {
            return;
        }

        let base = self.pool.base();
        unsafe { self.ranges.validate(base, BoundaryTagManager::HEADER_ID) };
        self.stats.validate();

        assert_all_equal(
            self.stats.free_blocks(),
            self.ranges.free_blocks(),
            self.tags.free_blocks(),
        );
        assert_all_equal(
            self.stats.free_bytes(),
            self.ranges.free_bytes(),
            self.tags.free_bytes(),
        );
    }

    /// Returns the number of free blocks currently tracked.
    pub fn free_blocks(&self) -> usize {
        self.stats.free_blocks()
    }

    /// Returns the total number of bytes in tracked free blocks.
    pub fn free_bytes(&self) -> usize {
        self.stats.free_bytes()
    }

    /// Writes boundary tags on `[addr, addr + size)` and links it into the
    /// free structure.
    unsafe fn add_to_freelist(&mut self, addr: NonZeroUsize, size: usize) {
        let base = self.pool.base();
        let block = unsafe { self.tags.write_tags(base, addr, size) };
        unsafe { self.ranges.insert(base, block) };
        self.stats.on_add_to_freelist(size);
    }

    /// Unlinks `block` from the free structure and erases its tags.
    unsafe fn remove_from_freelist(&mut self, block: NonZeroUsize) {
        let base = self.pool.base();
        let size = unsafe { base.record(block) }.size();

        self.stats.on_remove_from_freelist(size);
        unsafe { self.ranges.remove(base, block) };
        unsafe { self.tags.remove_tags(base, block) };
    }

    /// Expands the incoming block by folding in its free neighbor(s).
    unsafe fn coalesce(&mut self, mut addr: NonZeroUsize, mut size: usize) -> (NonZeroUsize, usize) {
        let base = self.pool.base();

        if let Some(preceding) = unsafe { self.tags.preceding_block(base, addr) } {
            let preceding_size = unsafe { base.record(preceding) }.size();
            addr = preceding;
            size += preceding_size;
            unsafe { self.remove_from_freelist(preceding) };
        }

        // folding in the predecessor moved addr down and grew size by the
        // same amount, so addr + size still denotes the end of the incoming
        // block, which is what the end-of-pool test requires
        if let Some(following) = unsafe {
            self.tags
                .following_block(base, addr, size, self.pool.committed_limit())
        } {
            let following_size = unsafe { base.record(following) }.size();
            size += following_size;
            unsafe { self.remove_from_freelist(following) };
        }

        (addr, size)
    }

    /// Takes a fitting block out of the free structure, splitting off a
    /// tracked tail when the remainder is large enough to carry tags.
    ///
    /// Returns the block's address and its true length: sub-minimum
    /// remainders cannot be tracked, so they stay bundled with the
    /// allocation.
    unsafe fn take_and_split_free_block(&mut self, size: usize) -> Option<(NonZeroUsize, usize)> {
        let base = self.pool.base();

        let block = unsafe { self.ranges.find(base, size) }?;
        let block_size = unsafe { base.record(block) }.size();
        let leftover_size = block_size - size;
        unsafe { self.remove_from_freelist(block) };

        if is_valid_size(leftover_size) {
            let tail = block.checked_add(size).expect("split tail address overflows");
            unsafe { self.add_to_freelist(tail, leftover_size) };
            Some((block, size))
        } else {
            Some((block, block_size))
        }
    }
}

impl<A: BackingAllocator> Drop for HeaderlessAllocator<A> {
    fn drop(&mut self) {
        self.validate();

        unsafe {
            self.backing_allocator
                .deallocate(self.pool.base().ptr(), self.layout)
        };
    }
}

impl<A: BackingAllocator> fmt::Debug for HeaderlessAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderlessAllocator")
            .field("pool", &self.pool)
            .field("free_blocks", &self.free_blocks())
            .field("free_bytes", &self.free_bytes())
            .finish()
    }
}

/// Like a `HeaderlessAllocator`, but without a `Drop` impl or an associated
/// allocator.
///
/// This assists in tacking on the allocator type parameter because this
/// struct can be moved out of, while `HeaderlessAllocator` itself cannot.
struct RawHeaderlessAllocator {
    pool: Pool,
    layout: Layout,
}

impl RawHeaderlessAllocator {
    unsafe fn try_new(
        region: NonNull<u8>,
        pool_size: usize,
    ) -> Result<RawHeaderlessAllocator, AllocInitError> {
        let layout = HeaderlessAllocator::<Raw>::region_layout(pool_size)?;
        let pool = unsafe { Pool::new(region, pool_size)? };

        Ok(RawHeaderlessAllocator { pool, layout })
    }

    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
    ) -> HeaderlessAllocator<A> {
        let RawHeaderlessAllocator { pool, layout } = self;

        HeaderlessAllocator {
            pool,
            ranges: SegregatedRangeLists::new(),
            tags: BoundaryTagManager::new(),
            stats: Stats::new(),
            layout,
            backing_allocator,
        }
    }
}
