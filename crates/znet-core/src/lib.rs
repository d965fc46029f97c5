//! # znet-core — shared building blocks
//!
//! Platform-agnostic primitives the rest of the toolkit is built from:
//!
//! - [`aflags`] — atomic flag words backing every coarse state machine
//! - [`storage`] — send frames and the per-socket segmented byte queue
//! - [`refheap`] — min-heap with external back-references (timer heap)
//! - [`pool`] — worker thread pool with a FIFO queue
//! - [`error`] — the toolkit-wide error enum

pub mod aflags;
pub mod error;
pub mod pool;
pub mod refheap;
pub mod storage;

pub use aflags::{AtomicFlags16, AtomicFlags32, AtomicFlags64, AtomicFlags8};
pub use error::{Error, Result};
pub use pool::ThreadPool;
pub use refheap::{Ref, RefHeap};
pub use storage::{AddError, DataFrame, DataStorage, FramePayload, FrameView};
