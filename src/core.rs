//! Re-exports of `core`, plus stable polyfills.
//!
//! The stable-compatible implementations in this module are copied more-or-less
//! verbatim from the standard library source.

pub mod alloc {
    pub use ::core::alloc::*;

    /// Indicates an allocation failure due to resource exhaustion or an
    /// unsupported set of arguments.
    #[cfg(not(feature = "unstable"))]
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct AllocError;
}

pub mod num {
    pub use ::core::num::*;

    // #![feature(int_log)]

    pub trait UsizeExt {
        fn log2(self) -> u32;
    }

    impl UsizeExt for usize {
        #[inline]
        fn log2(self) -> u32 {
            Self::BITS - 1 - self.leading_zeros()
        }
    }
}

pub mod ptr {
    pub use ::core::ptr::*;

    // #![feature(strict_provenance)]

    #[cfg(not(feature = "unstable"))]
    use ::core::num::NonZeroUsize;

    #[cfg(all(feature = "sptr", not(feature = "unstable")))]
    pub use sptr::Strict;

    #[cfg(not(feature = "unstable"))]
    pub trait NonNullStrict<T> {
        fn addr(self) -> NonZeroUsize
        where
            T: Sized;

        fn with_addr(self, addr: NonZeroUsize) -> Self
        where
            T: Sized;

        fn map_addr(self, f: impl FnOnce(NonZeroUsize) -> NonZeroUsize) -> Self
        where
            T: Sized;
    }

    #[cfg(not(feature = "unstable"))]
    impl<T> NonNullStrict<T> for NonNull<T> {
        fn addr(self) -> NonZeroUsize
        where
            T: Sized,
        {
            // SAFETY: The pointer is guaranteed by the type to be non-null,
            // meaning that the address will be non-zero.
            unsafe { NonZeroUsize::new_unchecked(self.as_ptr().addr()) }
        }

        fn with_addr(self, addr: NonZeroUsize) -> Self
        where
            T: Sized,
        {
            // SAFETY: The result of `ptr::with_addr` is non-null because `addr` is guaranteed to be non-zero.
            unsafe { NonNull::new_unchecked(self.as_ptr().with_addr(addr.get()) as *mut _) }
        }

        fn map_addr(self, f: impl FnOnce(NonZeroUsize) -> NonZeroUsize) -> Self
        where
            T: Sized,
        {
            self.with_addr(f(self.addr()))
        }
    }
}
