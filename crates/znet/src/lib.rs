//! # znet — an event-driven POSIX networking toolkit
//!
//! A readiness-based I/O reactor, a non-blocking TCP client/server
//! state machine with partial-write recovery and ordered teardown, a
//! heap-based timer service, a worker thread pool, an address resolver,
//! and an HTTP/1.1 layer on top.
//!
//! ```no_run
//! use std::sync::Arc;
//! use znet::reactor::AsyncLoop;
//! use znet::timers::Timers;
//! use znet::clock;
//!
//! let event_loop = AsyncLoop::new().unwrap();
//! event_loop.start().unwrap();
//!
//! let timers = Timers::new();
//! timers.start().unwrap();
//! timers
//!     .add_timeout(clock::after_ns(clock::ms_to_ns(10)), || {
//!         println!("tick");
//!     })
//!     .unwrap();
//! ```

pub mod logger;

pub use znet_core::{aflags, error, pool, refheap, storage};
pub use znet_core::{DataFrame, DataStorage, Error, Result, ThreadPool};
pub use znet_runtime::{addr, clock, reactor, timers};
pub use znet_runtime::{AsyncLoop, Ready, TimerRef, Timers};

pub use znet_http as http;
pub use znet_tcp as tcp;
