//! Send frames and the segmented byte queue
//!
//! A `DataFrame` is one unit of data a caller asked to send: an in-memory
//! byte slice (owned or shared read-only) or a file-descriptor slice sent
//! via zero-copy. `DataStorage` is the per-socket ordered queue of frames
//! not yet transmitted, drained from the head with partial-frame offsets.
//!
//! Frames are retired when `offset == len`. Retiring an owned byte frame
//! drops its buffer, a shared frame drops its refcount, and a file frame
//! closes its descriptor iff the queue owns it.

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::error::Error;

/// Backing data of a send frame.
pub enum FramePayload {
    /// Byte buffer owned by the frame, dropped on retirement
    Owned(Box<[u8]>),
    /// Shared read-only bytes; the queue never mutates or frees them
    /// beyond releasing its reference
    Shared(Arc<[u8]>),
    /// File slice sent with `sendfile`; `close_on_retire` transfers
    /// descriptor ownership to the queue
    File { fd: RawFd, close_on_retire: bool },
}

/// A view of the not-yet-transmitted part of a frame.
pub enum FrameView<'a> {
    Bytes(&'a [u8]),
    File { fd: RawFd, offset: u64, remaining: u64 },
}

/// One send frame. `offset` counts bytes already transmitted; for file
/// frames `offset` and `len` are absolute file positions.
pub struct DataFrame {
    payload: FramePayload,
    offset: u64,
    len: u64,
    free_on_err: bool,
}

impl DataFrame {
    /// An owned byte frame covering the whole buffer.
    pub fn bytes(data: impl Into<Box<[u8]>>) -> Self {
        let data = data.into();
        let len = data.len() as u64;
        Self {
            payload: FramePayload::Owned(data),
            offset: 0,
            len,
            free_on_err: false,
        }
    }

    /// A shared read-only byte frame.
    pub fn shared(data: Arc<[u8]>) -> Self {
        let len = data.len() as u64;
        Self {
            payload: FramePayload::Shared(data),
            offset: 0,
            len,
            free_on_err: false,
        }
    }

    /// A file slice `[offset..len)`. The descriptor is closed on
    /// retirement; use [`keep_open`](Self::keep_open) to retain it.
    pub fn file(fd: RawFd, offset: u64, len: u64) -> Self {
        debug_assert!(offset <= len);
        Self {
            payload: FramePayload::File {
                fd,
                close_on_retire: true,
            },
            offset,
            len,
            free_on_err: false,
        }
    }

    /// Start transmission `offset` bytes into a byte frame.
    pub fn at_offset(mut self, offset: u64) -> Self {
        debug_assert!(offset <= self.len);
        self.offset = offset;
        self
    }

    /// Drop the frame instead of handing it back when an enqueue or send
    /// fails. Construction-time choice, keeps caller error paths
    /// symmetric.
    pub fn free_on_err(mut self) -> Self {
        self.free_on_err = true;
        self
    }

    /// Do not close the file descriptor on retirement.
    pub fn keep_open(mut self) -> Self {
        if let FramePayload::File {
            ref mut close_on_retire,
            ..
        } = self.payload
        {
            *close_on_retire = false;
        }
        self
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.len - self.offset
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.offset == self.len
    }

    pub fn is_file(&self) -> bool {
        matches!(self.payload, FramePayload::File { .. })
    }

    pub fn frees_on_err(&self) -> bool {
        self.free_on_err
    }

    /// The un-sent tail of the frame.
    pub fn view(&self) -> FrameView<'_> {
        match &self.payload {
            FramePayload::Owned(data) => {
                FrameView::Bytes(&data[self.offset as usize..self.len as usize])
            }
            FramePayload::Shared(data) => {
                FrameView::Bytes(&data[self.offset as usize..self.len as usize])
            }
            FramePayload::File { fd, .. } => FrameView::File {
                fd: *fd,
                offset: self.offset,
                remaining: self.remaining(),
            },
        }
    }

    /// Record `n` more bytes as transmitted.
    pub fn advance(&mut self, n: u64) {
        debug_assert!(n <= self.remaining());
        self.offset += n;
    }
}

impl Drop for DataFrame {
    fn drop(&mut self) {
        if let FramePayload::File {
            fd,
            close_on_retire: true,
        } = self.payload
        {
            if fd >= 0 {
                drop(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
}

impl fmt::Debug for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.payload {
            FramePayload::Owned(_) => "owned",
            FramePayload::Shared(_) => "shared",
            FramePayload::File { fd, .. } => return write!(
                f,
                "DataFrame(file fd={} {}..{})",
                fd, self.offset, self.len
            ),
        };
        write!(f, "DataFrame({} {}..{})", kind, self.offset, self.len)
    }
}

/// Error from [`DataStorage::add`]: the queue is unchanged; the frame is
/// present unless it was constructed with `free_on_err`.
#[derive(Debug)]
pub struct AddError {
    pub error: Error,
    pub frame: Option<DataFrame>,
}

impl AddError {
    fn reject(error: Error, frame: DataFrame) -> Self {
        let frame = if frame.free_on_err { None } else { Some(frame) };
        Self { error, frame }
    }
}

/// Ordered queue of send frames with a running byte counter.
///
/// Invariants: while the queue is non-empty its head frame is live
/// (`offset < len`); `bytes` equals the sum of `remaining()` over all
/// frames; frame contents are never mutated by the queue.
#[derive(Debug, Default)]
pub struct DataStorage {
    frames: VecDeque<DataFrame>,
    bytes: u64,
}

impl DataStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame. Fails only when buffer growth fails, in which
    /// case the queue is byte-for-byte unchanged.
    pub fn add(&mut self, frame: DataFrame) -> Result<(), AddError> {
        if frame.is_empty() {
            // Nothing to transmit; retire immediately per ownership.
            return Ok(());
        }
        if self.frames.try_reserve(1).is_err() {
            return Err(AddError::reject(Error::NoMemory, frame));
        }
        self.bytes += frame.remaining();
        self.frames.push_back(frame);
        Ok(())
    }

    /// Consume exactly `n` bytes from the head, retiring every frame
    /// whose remainder is exhausted. `n` must not exceed `bytes()`.
    pub fn drain(&mut self, mut n: u64) {
        debug_assert!(n <= self.bytes);
        while n > 0 {
            let head = match self.frames.front_mut() {
                Some(head) => head,
                None => break,
            };
            let remaining = head.remaining();
            if remaining <= n {
                n -= remaining;
                self.bytes -= remaining;
                self.frames.pop_front();
            } else {
                head.advance(n);
                self.bytes -= n;
                n = 0;
            }
        }
    }

    /// Compaction point after a partial write. Retirement happens
    /// eagerly in `drain`, so only spare capacity is released here.
    pub fn finish(&mut self) {
        if self.frames.is_empty() && self.frames.capacity() > 32 {
            self.frames.shrink_to_fit();
        }
    }

    /// Retire all frames, respecting ownership flags.
    pub fn free_all(&mut self) {
        self.frames.clear();
        self.bytes = 0;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of not-yet-drained payload bytes.
    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn front(&self) -> Option<&DataFrame> {
        self.frames.front()
    }
}
