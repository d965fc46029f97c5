//! Monotonic clock helpers
//!
//! Timer deadlines are absolute `u64` nanoseconds on the monotonic
//! clock, anchored at a process-wide start point. Cheaper than a syscall
//! per reading and immune to wall-clock changes.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn anchor() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// Current monotonic time in nanoseconds.
#[inline]
pub fn now_ns() -> u64 {
    anchor().elapsed().as_nanos() as u64
}

/// A deadline `ns` nanoseconds from now.
#[inline]
pub fn after_ns(ns: u64) -> u64 {
    now_ns() + ns
}

/// Map an absolute deadline back onto an `Instant` for condvar waits.
#[inline]
pub fn instant_at(deadline_ns: u64) -> Instant {
    anchor() + Duration::from_nanos(deadline_ns)
}

#[inline]
pub const fn us_to_ns(us: u64) -> u64 {
    us * 1_000
}

#[inline]
pub const fn ms_to_ns(ms: u64) -> u64 {
    ms * 1_000_000
}

#[inline]
pub const fn sec_to_ns(sec: u64) -> u64 {
    sec * 1_000_000_000
}
