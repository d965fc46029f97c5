//! # znet-runtime — event loop, timers and address resolution
//!
//! The Linux-specific half of the toolkit:
//!
//! - [`reactor`] — an epoll readiness loop bound to one background
//!   thread, dispatching edge-triggered events to registered handlers
//! - [`timers`] — a heap-based timer service with one worker thread
//! - [`addr`] — synchronous and worker-dispatched `getaddrinfo`
//! - [`clock`] — monotonic nanosecond timestamps and conversions

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod addr;
        pub mod clock;
        pub mod reactor;
        pub mod timers;

        pub use addr::{AddrInfo, Family, Hints, LookupRequest};
        pub use reactor::{AsyncLoop, Control, LoopHandler, Ready};
        pub use timers::{TimerOpen, TimerRef, Timers, TimersGuard};
    } else {
        compile_error!("znet-runtime currently supports Linux only (epoll, eventfd, sendfile)");
    }
}
