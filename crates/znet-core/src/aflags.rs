//! Atomic flag words
//!
//! Every coarse state machine in the toolkit keeps its state in one
//! machine word of atomic bits, mutated only through these wrappers.
//! Two memory-ordering flavors are offered: the plain accessors are
//! sequentially consistent, the `_acq`/`_rel` accessors use
//! acquire/release ordering for hot paths that only need to order
//! against the flag itself.
//!
//! `test` is a single masked load, not a compare-and-swap: it offers no
//! atomicity across multiple flags. Transitions that must be observed
//! together have to be combined into a single `set` or `clear` call.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

macro_rules! atomic_flags {
    ($(#[$meta:meta])* $name:ident, $atomic:ty, $int:ty) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name($atomic);

        impl $name {
            pub const fn new(bits: $int) -> Self {
                Self(<$atomic>::new(bits))
            }

            /// Set the given bits, returning the previous word.
            #[inline]
            pub fn set(&self, bits: $int) -> $int {
                self.0.fetch_or(bits, Ordering::SeqCst)
            }

            /// Clear the given bits, returning the previous word.
            #[inline]
            pub fn clear(&self, bits: $int) -> $int {
                self.0.fetch_and(!bits, Ordering::SeqCst)
            }

            /// Load the word masked by `mask`.
            #[inline]
            pub fn get(&self, mask: $int) -> $int {
                self.0.load(Ordering::SeqCst) & mask
            }

            /// True if any bit of `mask` is set.
            #[inline]
            pub fn test(&self, mask: $int) -> bool {
                self.get(mask) != 0
            }

            #[inline]
            pub fn load(&self) -> $int {
                self.0.load(Ordering::SeqCst)
            }

            #[inline]
            pub fn store(&self, bits: $int) {
                self.0.store(bits, Ordering::SeqCst)
            }

            /// `set` with release ordering.
            #[inline]
            pub fn set_rel(&self, bits: $int) -> $int {
                self.0.fetch_or(bits, Ordering::AcqRel)
            }

            /// `clear` with release ordering.
            #[inline]
            pub fn clear_rel(&self, bits: $int) -> $int {
                self.0.fetch_and(!bits, Ordering::AcqRel)
            }

            /// Masked load with acquire ordering.
            #[inline]
            pub fn get_acq(&self, mask: $int) -> $int {
                self.0.load(Ordering::Acquire) & mask
            }

            /// `test` with acquire ordering.
            #[inline]
            pub fn test_acq(&self, mask: $int) -> bool {
                self.get_acq(mask) != 0
            }

            #[inline]
            pub fn load_acq(&self) -> $int {
                self.0.load(Ordering::Acquire)
            }

            #[inline]
            pub fn store_rel(&self, bits: $int) {
                self.0.store(bits, Ordering::Release)
            }
        }
    };
}

atomic_flags!(
    /// 8-bit atomic flag word
    AtomicFlags8,
    AtomicU8,
    u8
);
atomic_flags!(
    /// 16-bit atomic flag word
    AtomicFlags16,
    AtomicU16,
    u16
);
atomic_flags!(
    /// 32-bit atomic flag word
    AtomicFlags32,
    AtomicU32,
    u32
);
atomic_flags!(
    /// 64-bit atomic flag word
    AtomicFlags64,
    AtomicU64,
    u64
);
