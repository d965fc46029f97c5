//! The I/O reactor — an epoll readiness loop on a dedicated thread
//!
//! An `AsyncLoop` owns an epoll handle, an eventfd used to interrupt
//! `epoll_wait`, and a table mapping file descriptors to their handlers.
//! The background thread waits for readiness, looks up each fd and
//! invokes its handler. Events are edge-triggered when registered with
//! [`Ready::EDGE`]: a handler must drain readable and writable state
//! until the kernel reports would-block.
//!
//! All handlers of one loop run on the loop's thread, strictly
//! serialized. The table lock is never held while a handler runs, so a
//! handler may call `add`/`modify`/`remove`, including removing its own
//! fd during teardown.

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use parking_lot::Mutex;

use znet_core::aflags::AtomicFlags8;
use znet_core::error::{Error, Result};

/// Readiness bits delivered to handlers and used for registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready(u32);

impl Ready {
    pub const IN: Ready = Ready(1);
    pub const OUT: Ready = Ready(1 << 1);
    pub const ERR: Ready = Ready(1 << 2);
    pub const HUP: Ready = Ready(1 << 3);
    pub const RDHUP: Ready = Ready(1 << 4);
    /// Synthetic: final delivery after the loop removed the fd on a
    /// handler's [`Control::Close`].
    pub const CLOSED: Ready = Ready(1 << 5);
    /// Registration-only: edge-triggered delivery.
    pub const EDGE: Ready = Ready(1 << 6);

    pub const fn empty() -> Ready {
        Ready(0)
    }

    /// The default socket mask: edge-triggered read+write+peer-shutdown.
    pub const fn socket() -> Ready {
        Ready(Ready::IN.0 | Ready::OUT.0 | Ready::RDHUP.0 | Ready::EDGE.0)
    }

    #[inline]
    pub const fn or(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }

    #[inline]
    pub const fn contains(self, other: Ready) -> bool {
        self.0 & other.0 != 0
    }

    fn to_epoll(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.contains(Ready::IN) {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.contains(Ready::OUT) {
            flags |= EpollFlags::EPOLLOUT;
        }
        if self.contains(Ready::RDHUP) {
            flags |= EpollFlags::EPOLLRDHUP;
        }
        if self.contains(Ready::EDGE) {
            flags |= EpollFlags::EPOLLET;
        }
        flags
    }

    fn from_epoll(flags: EpollFlags) -> Ready {
        let mut ready = Ready::empty();
        if flags.contains(EpollFlags::EPOLLIN) {
            ready = ready.or(Ready::IN);
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            ready = ready.or(Ready::OUT);
        }
        if flags.contains(EpollFlags::EPOLLERR) {
            ready = ready.or(Ready::ERR);
        }
        if flags.contains(EpollFlags::EPOLLHUP) {
            ready = ready.or(Ready::HUP);
        }
        if flags.contains(EpollFlags::EPOLLRDHUP) {
            ready = ready.or(Ready::RDHUP);
        }
        ready
    }
}

/// What the loop should do with the fd after an event delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Keep,
    /// Remove the fd and deliver one final [`Ready::CLOSED`] event.
    Close,
}

/// A registered event target. Invoked only on the loop thread.
pub trait LoopHandler: Send + Sync {
    fn on_event(&self, ready: Ready) -> Control;
}

const STARTED: u8 = 1;
const STOPPED: u8 = 2;

/// Sentinel epoll data for the wake eventfd; real entries carry the fd.
const WAKE_KEY: u64 = u64::MAX;

/// One readiness loop with its fd table and background thread.
pub struct AsyncLoop {
    weak: std::sync::Weak<AsyncLoop>,
    epoll: Epoll,
    wake: OwnedFd,
    table: Mutex<HashMap<RawFd, Arc<dyn LoopHandler>>>,
    flags: AtomicFlags8,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncLoop {
    pub fn new() -> Result<Arc<AsyncLoop>> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(Error::from)?;

        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(Errno::last().into());
        }
        let wake = unsafe { OwnedFd::from_raw_fd(raw) };
        epoll
            .add(&wake, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_KEY))
            .map_err(Error::from)?;

        Ok(Arc::new_cyclic(|weak| AsyncLoop {
            weak: weak.clone(),
            epoll,
            wake,
            table: Mutex::new(HashMap::new()),
            flags: AtomicFlags8::new(0),
            thread: Mutex::new(None),
        }))
    }

    /// Spawn the background thread.
    pub fn start(&self) -> Result<()> {
        if self.flags.test(STOPPED) {
            return Err(Error::Closed);
        }
        if self.flags.set(STARTED) & STARTED != 0 {
            return Err(Error::BadArgument);
        }
        let this = match self.weak.upgrade() {
            Some(this) => this,
            None => return Err(Error::Closed),
        };
        let handle = thread::Builder::new()
            .name("znet-loop".into())
            .spawn(move || loop_thread(this))
            .map_err(Error::from)?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Register a handler for `fd`. At most one handler per fd.
    pub fn add(&self, fd: RawFd, ready: Ready, handler: Arc<dyn LoopHandler>) -> Result<()> {
        if self.flags.test(STOPPED) {
            return Err(Error::Closed);
        }
        let mut table = self.table.lock();
        if table.contains_key(&fd) {
            return Err(Error::BadArgument);
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed, EpollEvent::new(ready.to_epoll(), fd as u32 as u64))
            .map_err(Error::from)?;
        table.insert(fd, handler);
        trace!("loop: added fd {}", fd);
        Ok(())
    }

    /// Change the registered event mask of `fd`.
    pub fn modify(&self, fd: RawFd, ready: Ready) -> Result<()> {
        if self.flags.test(STOPPED) {
            return Err(Error::Closed);
        }
        let table = self.table.lock();
        if !table.contains_key(&fd) {
            return Err(Error::NotFound);
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut event = EpollEvent::new(ready.to_epoll(), fd as u32 as u64);
        self.epoll.modify(borrowed, &mut event).map_err(Error::from)
    }

    /// Drop the registration of `fd`. The fd itself stays open.
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        if self.flags.test(STOPPED) {
            return Err(Error::Closed);
        }
        let mut table = self.table.lock();
        if table.remove(&fd).is_none() {
            return Err(Error::NotFound);
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(borrowed).map_err(Error::from)
    }

    /// Request thread exit: set the flag and interrupt `epoll_wait`.
    pub fn stop(&self) {
        self.flags.set(STOPPED);
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                std::os::fd::AsRawFd::as_raw_fd(&self.wake),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            warn!("loop: wake write failed: {}", Errno::last());
        }
    }

    /// Stop and join the background thread, then release the table.
    pub fn shutdown(&self) {
        self.stop();
        if let Some(handle) = self.thread.lock().take() {
            // The loop thread itself may drop the last handle after an
            // external stop; it must not join itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.table.lock().clear();
    }

    /// Number of registered fds.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handler_of(&self, fd: RawFd) -> Option<Arc<dyn LoopHandler>> {
        self.table.lock().get(&fd).cloned()
    }
}

impl Drop for AsyncLoop {
    fn drop(&mut self) {
        // The running thread keeps its own Arc, so a started loop only
        // reaches this point after `stop`/`shutdown`. For a loop that
        // never started this releases the epoll and table directly.
        self.shutdown();
    }
}

fn loop_thread(this: Arc<AsyncLoop>) {
    trace!("loop thread started");
    let mut events = vec![EpollEvent::empty(); 128];
    loop {
        if this.flags.test(STOPPED) {
            break;
        }
        let n = match this.epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("loop: epoll_wait failed: {}", e);
                break;
            }
        };
        for event in &events[..n] {
            let key = event.data();
            if key == WAKE_KEY {
                let mut buf = 0u64;
                let _ = unsafe {
                    libc::read(
                        std::os::fd::AsRawFd::as_raw_fd(&this.wake),
                        &mut buf as *mut u64 as *mut libc::c_void,
                        std::mem::size_of::<u64>(),
                    )
                };
                continue;
            }
            let fd = key as u32 as i32;
            // Clone out of the table so the handler runs unlocked and
            // may mutate the table itself.
            let handler = match this.handler_of(fd) {
                Some(handler) => handler,
                None => continue,
            };
            let ready = Ready::from_epoll(event.events());
            if handler.on_event(ready) == Control::Close {
                debug!("loop: handler closed fd {}", fd);
                let _ = this.remove(fd);
                let _ = handler.on_event(Ready::CLOSED);
            }
        }
    }
    trace!("loop thread exiting");
}
