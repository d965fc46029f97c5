//! TCP socket state machine
//!
//! A non-blocking socket driven by an [`AsyncLoop`]. Lifecycle events
//! flow reactor → state machine → user handler; outbound writes try the
//! kernel inline and fall back into the segmented send queue on partial
//! writes, drained on the next writability edge.
//!
//! Close discipline: `close` is graceful (flush the queue, then
//! `shutdown(WR)`, then wait for the peer's EOF), `terminate` is
//! abortive (drop the queue, `shutdown(RDWR)`). Resource release is
//! arbitrated between the user's `free` call and the internal teardown
//! through the CONFIRMED_FREE flag: whichever arrives second performs
//! the release and fires `Deinit`/`Free`.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, trace};
use nix::errno::Errno;
use parking_lot::Mutex;

use znet_core::aflags::AtomicFlags8;
use znet_core::error::{Error, Result};
use znet_core::storage::{AddError, DataFrame, DataStorage};
use znet_core::storage::FrameView;
use znet_runtime::addr::{self, AddrInfo, Family, Hints, LookupRequest};
use znet_runtime::reactor::{AsyncLoop, Control, LoopHandler, Ready};

pub(crate) const OPENED: u8 = 1;
pub(crate) const CLOSING: u8 = 1 << 1;
pub(crate) const CLOSING_FAST: u8 = 1 << 2;
pub(crate) const CLOSE_GUARD: u8 = 1 << 3;
pub(crate) const CONFIRMED_FREE: u8 = 1 << 4;

/// Socket lifecycle events delivered to the user handler, in reactor
/// order. `Close` carries the cause: `None` for a clean peer close,
/// otherwise the kernel error taken from the socket error queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    Data,
    CanSend,
    ReadClose,
    Close { err: Option<Errno> },
    Deinit,
    Free,
}

/// The single callback surface of a socket. Invoked on the reactor
/// thread (or, for `Deinit`/`Free`, on whichever thread loses the
/// teardown arbitration). No lock of the socket is held during calls,
/// so the handler may reenter any socket API.
pub trait SocketHandler: Send + Sync {
    fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent);
}

/// Per-socket behavior switches. Fixed at construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    /// Deliver [`SocketEvent::CanSend`] on writability instead of
    /// draining the send queue inline.
    pub wants_can_send: bool,
    /// Call `close` after [`SocketEvent::ReadClose`].
    pub auto_close_on_read_close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Client,
    ServerChild,
}

/// Construction options for a client socket. Either `addrs` or
/// `hostname` + `port` must be given; with only a hostname the
/// resolution runs asynchronously on a detached worker.
pub struct Options {
    pub event_loop: Arc<AsyncLoop>,
    pub addrs: Option<Vec<AddrInfo>>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub family: Family,
    pub settings: Settings,
}

/// Failure from [`Socket::send`]. The frame rides along unless it was
/// constructed with `free_on_err`.
#[derive(Debug)]
pub struct SendError {
    pub error: Error,
    pub frame: Option<DataFrame>,
}

impl SendError {
    fn reject(error: Error, frame: DataFrame) -> Self {
        let frame = if frame.frees_on_err() { None } else { Some(frame) };
        Self { error, frame }
    }

    fn from_add(e: AddError) -> Self {
        Self {
            error: e.error,
            frame: e.frame,
        }
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "send failed: {}", self.error)
    }
}

impl std::error::Error for SendError {}

/// Why a [`Socket::read`] loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// The buffer was filled; more data may be pending
    Filled,
    /// Kernel buffer drained; wait for the next `Data` event
    WouldBlock,
    /// Peer sent EOF
    Eof,
    Err(Errno),
}

enum Drained {
    /// Queue empty, nothing pending
    Empty,
    /// Partial write; remainder stays queued
    WouldBlock,
    /// Peer gone; queue dropped, CLOSING_FAST set
    Fatal,
    /// Queue flushed and the graceful close shut the write side
    Shutdown,
}

/// A non-blocking TCP socket bound to a reactor.
pub struct Socket {
    weak: Weak<Socket>,
    fd: AtomicI32,
    flags: AtomicFlags8,
    kind: Kind,
    settings: Settings,
    event_loop: Arc<AsyncLoop>,
    queue: Mutex<DataStorage>,
    handler: Arc<dyn SocketHandler>,
}

impl Socket {
    /// Create a client socket and start connecting. With a resolved
    /// address list the connect walk runs on the calling thread; with a
    /// hostname it is dispatched behind an asynchronous lookup and
    /// failures surface through `Close { err }`.
    pub fn connect(options: Options, handler: Arc<dyn SocketHandler>) -> Result<Arc<Socket>> {
        if options.addrs.is_none() && (options.hostname.is_none() || options.port.is_none()) {
            return Err(Error::BadArgument);
        }
        let socket = Arc::new_cyclic(|weak| Socket {
            weak: weak.clone(),
            fd: AtomicI32::new(-1),
            flags: AtomicFlags8::new(0),
            kind: Kind::Client,
            settings: options.settings,
            event_loop: options.event_loop.clone(),
            queue: Mutex::new(DataStorage::new()),
            handler,
        });

        match options.addrs {
            Some(addrs) => {
                socket.connect_walk(&addrs)?;
                Ok(socket)
            }
            None => {
                let request = LookupRequest {
                    hostname: options.hostname,
                    service: options.port.map(|p| p.to_string()),
                    hints: Hints {
                        family: options.family,
                        ..Default::default()
                    },
                };
                let this = socket.clone();
                addr::lookup_async(request, None, move |_request, result| {
                    let outcome = match result {
                        Ok(addrs) => this.connect_walk(&addrs),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = outcome {
                        debug!("socket: connect failed: {}", e);
                        this.free_internal(Some(e.errno()));
                    }
                })?;
                Ok(socket)
            }
        }
    }

    /// Wrap an accepted connection. Used by the server accept loop.
    pub(crate) fn adopt(
        fd: RawFd,
        settings: Settings,
        event_loop: Arc<AsyncLoop>,
        handler: Arc<dyn SocketHandler>,
    ) -> Result<Arc<Socket>> {
        let socket = Arc::new_cyclic(|weak| Socket {
            weak: weak.clone(),
            fd: AtomicI32::new(fd),
            flags: AtomicFlags8::new(0),
            kind: Kind::ServerChild,
            settings,
            event_loop: event_loop.clone(),
            queue: Mutex::new(DataStorage::new()),
            handler,
        });
        event_loop.add(fd, Ready::socket(), socket.clone())?;
        Ok(socket)
    }

    /// An owning handle to this socket; present as long as any `Arc`
    /// (user's or the reactor table's) is alive, which holds whenever a
    /// method can be entered.
    fn strong(&self) -> Option<Arc<Socket>> {
        self.weak.upgrade()
    }

    /// Walk the candidate list: non-blocking connect, register with the
    /// reactor on success/in-progress/would-block, retry the transient
    /// class, advance otherwise.
    fn connect_walk(&self, addrs: &[AddrInfo]) -> Result<()> {
        let mut resets: u8 = 0;
        let mut idx = 0;
        while idx < addrs.len() {
            let info = &addrs[idx];
            let fd = {
                let queue = self.queue.lock();
                let old = self.fd.swap(-1, Ordering::SeqCst);
                if old != -1 {
                    drop(unsafe { OwnedFd::from_raw_fd(old) });
                }
                if self.flags.test(CLOSING_FAST)
                    || (self.flags.test(CLOSING) && queue.is_empty())
                {
                    return Err(Error::Closed);
                }
                let fd = unsafe {
                    libc::socket(
                        info.family,
                        info.socktype | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                        info.protocol,
                    )
                };
                if fd < 0 {
                    return Err(Errno::last().into());
                }
                default_socket_options(fd);
                self.fd.store(fd, Ordering::SeqCst);
                fd
            };

            let rc = unsafe {
                libc::connect(
                    fd,
                    &info.addr as *const libc::sockaddr_storage as *const libc::sockaddr,
                    info.addrlen,
                )
            };
            let errno = if rc == 0 { None } else { Some(Errno::last()) };
            match errno {
                None | Some(Errno::EINTR) | Some(Errno::EINPROGRESS) | Some(Errno::EAGAIN) => {
                    let this = self.strong().ok_or(Error::Closed)?;
                    self.event_loop.add(fd, Ready::socket(), this)?;
                    trace!("socket: connecting fd {}", fd);
                    return Ok(());
                }
                Some(Errno::EPIPE) | Some(Errno::ECONNRESET) => {
                    resets += 1;
                    if resets != 3 {
                        continue;
                    }
                    resets = 0;
                    idx += 1;
                }
                Some(_) => {
                    idx += 1;
                }
            }
        }
        let old = self.fd.swap(-1, Ordering::SeqCst);
        if old != -1 {
            drop(unsafe { OwnedFd::from_raw_fd(old) });
        }
        Err(Error::Unreachable)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::SeqCst)
    }

    pub fn event_loop(&self) -> &Arc<AsyncLoop> {
        &self.event_loop
    }

    /// True for sockets materialized by a server accept loop.
    pub fn is_server_child(&self) -> bool {
        self.kind == Kind::ServerChild
    }

    pub fn is_open(&self) -> bool {
        self.flags.test(OPENED)
    }

    pub fn is_closing(&self) -> bool {
        self.flags.test(CLOSING | CLOSING_FAST)
    }

    /// Bytes buffered in the send queue.
    pub fn queued_bytes(&self) -> u64 {
        self.queue.lock().bytes()
    }

    pub fn local_port(&self) -> Result<u16> {
        local_port_of(self.fd())
    }

    /// Send a frame. Drains buffered frames first; on a partial write
    /// the frame joins the queue and completes via the reactor. After
    /// `close`/`terminate`/`CLOSE_GUARD` this fails with `EPIPE`.
    pub fn send(&self, frame: DataFrame) -> std::result::Result<(), SendError> {
        let mut queue = self.queue.lock();
        if self.flags.test(CLOSING | CLOSING_FAST | CLOSE_GUARD) {
            drop(queue);
            return Err(SendError::reject(Error::Sys(Errno::EPIPE), frame));
        }

        match self.send_buffered_locked(&mut queue) {
            Drained::Fatal | Drained::Shutdown => {
                drop(queue);
                return Err(SendError::reject(Error::Sys(Errno::EPIPE), frame));
            }
            Drained::WouldBlock => {
                return queue.add(frame).map_err(SendError::from_add);
            }
            Drained::Empty => {}
        }
        if !self.flags.test(OPENED) {
            // Not connected yet; park until the open edge drains it.
            return queue.add(frame).map_err(SendError::from_add);
        }

        let mut frame = frame;
        loop {
            match self.send_frame(&frame) {
                Ok(0) => {
                    return queue.add(frame).map_err(SendError::from_add);
                }
                Ok(n) => {
                    frame.advance(n as u64);
                    if frame.is_empty() {
                        return Ok(());
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                    self.flags.set(CLOSING_FAST);
                    drop(queue);
                    return Err(SendError::reject(Error::Sys(Errno::EPIPE), frame));
                }
                Err(_) => {
                    // Park the remainder; the failure will surface
                    // through the close event.
                    return queue.add(frame).map_err(SendError::from_add);
                }
            }
        }
    }

    /// Read into `buf`, absorbing `EINTR`, until it is full or the
    /// kernel buffer drains.
    pub fn read(&self, buf: &mut [u8]) -> (usize, ReadState) {
        let fd = self.fd();
        let mut done = 0;
        while done < buf.len() {
            let n = unsafe {
                libc::recv(
                    fd,
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - done,
                    0,
                )
            };
            if n < 0 {
                match Errno::last() {
                    Errno::EINTR => continue,
                    Errno::EAGAIN => return (done, ReadState::WouldBlock),
                    e => return (done, ReadState::Err(e)),
                }
            }
            if n == 0 {
                return (done, ReadState::Eof);
            }
            done += n as usize;
        }
        (done, ReadState::Filled)
    }

    /// Graceful close: flush the queue, half-close the write side, wait
    /// for the peer's EOF. Idempotent.
    pub fn close(&self) {
        let queue = self.queue.lock();
        self.flags.set(CLOSING);
        if self.flags.test(OPENED) && queue.is_empty() && !self.flags.test(CLOSE_GUARD) {
            self.flags.set(CLOSE_GUARD);
            unsafe { libc::shutdown(self.fd(), libc::SHUT_WR) };
        }
    }

    /// Abortive close: drop the queue and shut both directions.
    pub fn terminate(&self) {
        let mut queue = self.queue.lock();
        self.flags.set(CLOSING_FAST);
        queue.free_all();
        if self.flags.test(OPENED) && !self.flags.test(CLOSE_GUARD) {
            self.flags.set(CLOSE_GUARD);
            unsafe { libc::shutdown(self.fd(), libc::SHUT_RDWR) };
        }
    }

    /// User half of the teardown arbitration. The first of `free` and
    /// the internal teardown flips CONFIRMED_FREE; the second releases
    /// the resources and fires `Deinit` + `Free`.
    pub fn free(&self) {
        let confirmed = {
            let _queue = self.queue.lock();
            self.flags.set(CONFIRMED_FREE) & CONFIRMED_FREE != 0
        };
        if confirmed {
            self.free_common();
        }
    }

    /// Internal teardown: fires `Close { err }`, then arbitrates.
    pub(crate) fn free_internal(&self, reason: Option<Errno>) {
        if let Some(this) = self.strong() {
            self.handler
                .on_event(&this, SocketEvent::Close { err: reason });
        }
        let confirmed = {
            let _queue = self.queue.lock();
            let was = self.flags.set(CONFIRMED_FREE) & CONFIRMED_FREE != 0;
            if !was {
                let _ = self.event_loop.remove(self.fd());
            }
            was
        };
        if confirmed {
            self.free_common();
        }
    }

    fn free_common(&self) {
        trace!("socket: releasing fd {}", self.fd());
        let this = self.strong();
        if self.flags.test(OPENED) {
            if let Some(this) = &this {
                self.handler.on_event(this, SocketEvent::Deinit);
            }
        }
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd != -1 {
            // The loop's table entry may still exist when the user's
            // free arrived before the internal teardown.
            let _ = self.event_loop.remove(fd);
            drop(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        self.queue.lock().free_all();
        self.flags.store(0);
        if let Some(this) = &this {
            self.handler.on_event(this, SocketEvent::Free);
        }
    }

    /// Drain the queue into the kernel. When it empties under a pending
    /// graceful close, issue the deferred `shutdown(WR)`.
    fn send_buffered_locked(&self, queue: &mut DataStorage) -> Drained {
        while !queue.is_empty() {
            let sent = {
                let front = queue.front().expect("non-empty queue");
                self.send_frame(front)
            };
            match sent {
                Ok(n) => queue.drain(n as u64),
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                    self.flags.set(CLOSING_FAST);
                    queue.free_all();
                    return Drained::Fatal;
                }
                Err(Errno::EAGAIN) => {
                    queue.finish();
                    return Drained::WouldBlock;
                }
                Err(_) => return Drained::WouldBlock,
            }
        }
        if !self.flags.test(CLOSE_GUARD) && self.flags.test(CLOSING) {
            self.flags.set(CLOSE_GUARD);
            unsafe { libc::shutdown(self.fd(), libc::SHUT_WR) };
            return Drained::Shutdown;
        }
        Drained::Empty
    }

    /// One kernel write of the frame's un-sent tail.
    fn send_frame(&self, frame: &DataFrame) -> std::result::Result<usize, Errno> {
        let fd = self.fd();
        let n = match frame.view() {
            FrameView::Bytes(buf) => unsafe {
                libc::send(
                    fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    libc::MSG_NOSIGNAL,
                )
            },
            FrameView::File {
                fd: file_fd,
                offset,
                remaining,
            } => {
                let mut off = offset as libc::off_t;
                unsafe { libc::sendfile(fd, file_fd, &mut off, remaining as usize) }
            }
        };
        if n < 0 {
            Err(Errno::last())
        } else {
            Ok(n as usize)
        }
    }

    fn so_error(&self) -> i32 {
        let mut code: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        unsafe {
            libc::getsockopt(
                self.fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut code as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        code
    }

    /// The reactor event contract for client and server-child sockets.
    fn dispatch(this: &Arc<Self>, events: Ready) {
        if this.fd() == -1 {
            // Released while the event was in flight.
            return;
        }
        let mut events = events;
        let mut code: i32 = 0;

        if events.contains(Ready::ERR) {
            code = this.so_error();
        } else {
            if !this.flags.test(OPENED) && events.contains(Ready::OUT) {
                this.flags.set(OPENED);
                this.handler.on_event(this, SocketEvent::Open);

                // The open callback may have requested a close already.
                let mut shutdown_how: Option<libc::c_int> = None;
                {
                    let mut queue = this.queue.lock();
                    if !this.flags.test(CLOSE_GUARD) {
                        if this.flags.test(CLOSING_FAST) {
                            queue.free_all();
                            this.flags.set(CLOSE_GUARD);
                            shutdown_how = Some(libc::SHUT_RDWR);
                            events = events.or(Ready::HUP);
                        } else if this.flags.test(CLOSING) && queue.is_empty() {
                            this.flags.set(CLOSE_GUARD);
                            shutdown_how = Some(libc::SHUT_WR);
                        }
                    }
                }
                if let Some(how) = shutdown_how {
                    unsafe { libc::shutdown(this.fd(), how) };
                }
                code = this.so_error();
            }
            if events.contains(Ready::IN) {
                this.handler.on_event(this, SocketEvent::Data);
            }
        }

        if events.contains(Ready::HUP) || code != 0 {
            let reason = if code != 0 {
                Some(Errno::from_raw(code))
            } else {
                None
            };
            this.free_internal(reason);
            return;
        }

        if events.contains(Ready::OUT) {
            if this.settings.wants_can_send {
                this.handler.on_event(this, SocketEvent::CanSend);
            } else {
                let mut queue = this.queue.lock();
                if !this.flags.test(CLOSING_FAST) {
                    let _ = this.send_buffered_locked(&mut queue);
                }
            }
        }

        if events.contains(Ready::RDHUP) {
            this.handler.on_event(this, SocketEvent::ReadClose);
            if this.settings.auto_close_on_read_close {
                this.close();
            }
        }
    }

    // Socket option toggles, applied to the live fd.

    pub fn nodelay_on(&self) {
        set_int_opt(self.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
    }

    pub fn nodelay_off(&self) {
        set_int_opt(self.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, 0);
    }

    pub fn cork_on(&self) {
        set_int_opt(self.fd(), libc::IPPROTO_TCP, libc::TCP_CORK, 1);
    }

    pub fn cork_off(&self) {
        set_int_opt(self.fd(), libc::IPPROTO_TCP, libc::TCP_CORK, 0);
    }

    pub fn keepalive_on(&self) {
        self.keepalive_on_explicit(1, 1, 10);
    }

    pub fn keepalive_on_explicit(&self, idle: i32, reprobe: i32, retries: i32) {
        let fd = self.fd();
        set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, idle);
        set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, reprobe);
        set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, retries);
        set_int_opt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_USER_TIMEOUT,
            (idle + reprobe * retries) * 1000,
        );
        set_int_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1);
    }

    pub fn keepalive_off(&self) {
        let fd = self.fd();
        set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_USER_TIMEOUT, 0);
        set_int_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 0);
    }
}

impl LoopHandler for Socket {
    fn on_event(&self, ready: Ready) -> Control {
        if ready.contains(Ready::CLOSED) {
            return Control::Keep;
        }
        if let Some(this) = self.weak.upgrade() {
            Socket::dispatch(&this, ready);
        }
        Control::Keep
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // Backstop for sockets abandoned without the free protocol.
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd != -1 {
            drop(unsafe { OwnedFd::from_raw_fd(fd) });
        }
    }
}

pub(crate) fn set_int_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int) {
    unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
}

pub(crate) fn default_socket_options(fd: RawFd) {
    set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
}

pub(crate) fn local_port_of(fd: RawFd) -> Result<u16> {
    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut addr as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(Errno::last().into());
    }
    match addr.ss_family as libc::c_int {
        libc::AF_INET => {
            let v4 = unsafe { &*(&addr as *const _ as *const libc::sockaddr_in) };
            Ok(u16::from_be(v4.sin_port))
        }
        libc::AF_INET6 => {
            let v6 = unsafe { &*(&addr as *const _ as *const libc::sockaddr_in6) };
            Ok(u16::from_be(v6.sin6_port))
        }
        _ => Err(Error::BadArgument),
    }
}
