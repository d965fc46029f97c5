//! TCP server — the listening-socket variant
//!
//! A `Server` owns a listening fd registered with a reactor. On
//! readability it accepts until would-block, hands each connection to
//! the user's `on_open` for configuration, and registers the resulting
//! child socket with the configured loop (the server's by default).

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, trace};
use nix::errno::Errno;
use parking_lot::Mutex;

use znet_core::aflags::AtomicFlags8;
use znet_core::error::{Error, Result};
use znet_runtime::addr::{self, AddrInfo, Family, Hints};
use znet_runtime::reactor::{AsyncLoop, Control, LoopHandler, Ready};

use crate::socket::{
    default_socket_options, local_port_of, set_int_opt, Settings, Socket, SocketHandler,
    CLOSE_GUARD, CLOSING, CONFIRMED_FREE, OPENED,
};

/// Server lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Close { err: Option<Errno> },
    Deinit,
    Free,
}

/// Configuration of one accepted connection, filled in by the user's
/// `on_open` before the child is registered.
pub struct ChildConfig {
    /// Event handler of the child; accepting without one rejects the
    /// connection.
    pub handler: Option<Arc<dyn SocketHandler>>,
    pub settings: Settings,
    /// Loop to bind the child to; `None` uses the server's loop.
    pub event_loop: Option<Arc<AsyncLoop>>,
}

/// User callback surface of a server.
pub trait ServerHandler: Send + Sync {
    /// A connection was accepted. Configure `child` and return `true`
    /// to keep it, `false` to drop it.
    fn on_open(&self, server: &Arc<Server>, child: &mut ChildConfig) -> bool;

    /// Lifecycle events other than accepts.
    fn on_event(&self, server: &Arc<Server>, event: ServerEvent);
}

/// Construction options for a listening socket.
pub struct ServerOptions {
    pub event_loop: Arc<AsyncLoop>,
    pub addrs: Option<Vec<AddrInfo>>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub family: Family,
    pub backlog: i32,
}

/// A listening socket bound to a reactor.
pub struct Server {
    weak: Weak<Server>,
    fd: AtomicI32,
    flags: AtomicFlags8,
    event_loop: Arc<AsyncLoop>,
    handler: Arc<dyn ServerHandler>,
    lock: Mutex<()>,
}

impl Server {
    /// Resolve (synchronously), bind, listen and register. The opened
    /// flag flips immediately rather than on a readiness event.
    pub fn listen(options: ServerOptions, handler: Arc<dyn ServerHandler>) -> Result<Arc<Server>> {
        let addrs = match options.addrs {
            Some(addrs) => addrs,
            None => {
                if options.port.is_none() {
                    return Err(Error::BadArgument);
                }
                let hints = Hints {
                    family: options.family,
                    passive: true,
                    ..Default::default()
                };
                addr::lookup(
                    options.hostname.as_deref(),
                    options.port.map(|p| p.to_string()).as_deref(),
                    &hints,
                )?
            }
        };

        let server = Arc::new_cyclic(|weak| Server {
            weak: weak.clone(),
            fd: AtomicI32::new(-1),
            flags: AtomicFlags8::new(0),
            event_loop: options.event_loop.clone(),
            handler,
            lock: Mutex::new(()),
        });

        let backlog = if options.backlog == 0 { 32 } else { options.backlog };
        for info in &addrs {
            let fd = unsafe {
                libc::socket(
                    info.family,
                    info.socktype | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    info.protocol,
                )
            };
            if fd < 0 {
                continue;
            }
            set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);
            let bound = unsafe {
                libc::bind(
                    fd,
                    &info.addr as *const libc::sockaddr_storage as *const libc::sockaddr,
                    info.addrlen,
                )
            } == 0
                && unsafe { libc::listen(fd, backlog) } == 0;
            if !bound {
                drop(unsafe { OwnedFd::from_raw_fd(fd) });
                continue;
            }
            server.fd.store(fd, Ordering::SeqCst);
            server
                .event_loop
                .add(fd, Ready::IN.or(Ready::EDGE), server.clone())?;
            server.flags.set(OPENED);
            trace!("server: listening on fd {}", fd);
            return Ok(server);
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

    /// The port the kernel actually bound (useful after binding port 0).
    pub fn local_port(&self) -> Result<u16> {
        local_port_of(self.fd())
    }

    /// Stop accepting: shut the listener down both ways. Teardown
    /// completes through the reactor's HUP delivery.
    pub fn close(&self) {
        let _guard = self.lock.lock();
        self.flags.set(CLOSING);
        if self.flags.test(OPENED) && !self.flags.test(CLOSE_GUARD) {
            self.flags.set(CLOSE_GUARD);
            unsafe { libc::shutdown(self.fd(), libc::SHUT_RDWR) };
        }
    }

    fn strong(&self) -> Option<Arc<Server>> {
        self.weak.upgrade()
    }

    /// User half of the teardown arbitration, as for sockets.
    pub fn free(&self) {
        let confirmed = {
            let _guard = self.lock.lock();
            self.flags.set(CONFIRMED_FREE) & CONFIRMED_FREE != 0
        };
        if confirmed {
            self.free_common();
        }
    }

    fn free_internal(&self, reason: Option<Errno>) {
        if let Some(this) = self.strong() {
            self.handler
                .on_event(&this, ServerEvent::Close { err: reason });
        }
        let confirmed = {
            let _guard = self.lock.lock();
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
        let this = self.strong();
        if self.flags.test(OPENED) {
            if let Some(this) = &this {
                self.handler.on_event(this, ServerEvent::Deinit);
            }
        }
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd != -1 {
            let _ = self.event_loop.remove(fd);
            drop(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        self.flags.store(0);
        if let Some(this) = &this {
            self.handler.on_event(this, ServerEvent::Free);
        }
    }

    /// Accept until would-block; transient errors retry, the rest end
    /// the batch.
    fn accept_loop(this: &Arc<Self>) {
        loop {
            let fd = unsafe {
                libc::accept4(
                    this.fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                match Errno::last() {
                    Errno::EINTR
                    | Errno::EPIPE
                    | Errno::EPERM
                    | Errno::EPROTO
                    | Errno::ECONNRESET
                    | Errno::ECONNABORTED => continue,
                    _ => return,
                }
            }
            default_socket_options(fd);

            let mut config = ChildConfig {
                handler: None,
                settings: Settings::default(),
                event_loop: None,
            };
            if !this.handler.on_open(this, &mut config) {
                drop(unsafe { OwnedFd::from_raw_fd(fd) });
                continue;
            }
            let handler = match config.handler.take() {
                Some(handler) => handler,
                None => {
                    drop(unsafe { OwnedFd::from_raw_fd(fd) });
                    continue;
                }
            };
            let event_loop = config
                .event_loop
                .take()
                .unwrap_or_else(|| this.event_loop.clone());
            match Socket::adopt(fd, config.settings, event_loop, handler) {
                Ok(_child) => trace!("server: accepted fd {}", fd),
                Err(e) => {
                    // adopt closed the fd through the socket's Drop
                    debug!("server: failed to register accepted fd: {}", e);
                }
            }
        }
    }
}

impl LoopHandler for Server {
    fn on_event(&self, ready: Ready) -> Control {
        if ready.contains(Ready::CLOSED) {
            return Control::Keep;
        }
        let this = match self.weak.upgrade() {
            Some(this) => this,
            None => return Control::Keep,
        };
        if ready.contains(Ready::HUP) || ready.contains(Ready::ERR) {
            this.free_internal(None);
            return Control::Keep;
        }
        if ready.contains(Ready::IN) {
            Server::accept_loop(&this);
        }
        Control::Keep
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd != -1 {
            drop(unsafe { OwnedFd::from_raw_fd(fd) });
        }
    }
}
