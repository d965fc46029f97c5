//! Error types shared by all znet crates

use core::fmt;

use nix::errno::Errno;

/// Result type for znet operations
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur across the toolkit.
///
/// Retryable kernel errors (`EINTR`, `EAGAIN`, `EINPROGRESS`) are absorbed
/// inside the components and never reach the caller through this type,
/// except for `WouldBlock` on APIs documented to be retried via the
/// reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Transient; retry when the reactor reports readiness
    WouldBlock,

    /// Buffer growth failed; the target structure is unchanged
    NoMemory,

    /// No candidate address produced a usable socket
    Unreachable,

    /// Constructor called with neither an address list nor hostname+port
    BadArgument,

    /// Handle is dead: the timer already fired or was cancelled
    NotFound,

    /// Component was stopped; no further operations accepted
    Closed,

    /// Any other kernel error, delivered verbatim
    Sys(Errno),
}

impl Error {
    /// The errno a C caller would observe for this error.
    pub fn errno(&self) -> Errno {
        match self {
            Error::WouldBlock => Errno::EAGAIN,
            Error::NoMemory => Errno::ENOMEM,
            Error::Unreachable => Errno::EHOSTUNREACH,
            Error::BadArgument => Errno::EINVAL,
            Error::NotFound => Errno::ENOENT,
            Error::Closed => Errno::EPIPE,
            Error::Sys(e) => *e,
        }
    }

    /// True for errors that a reactor-driven retry can resolve.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        match e {
            Errno::EAGAIN => Error::WouldBlock,
            Errno::ENOMEM => Error::NoMemory,
            Errno::EINVAL => Error::BadArgument,
            e => Error::Sys(e),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => Errno::from_raw(code).into(),
            None => Error::BadArgument,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WouldBlock => write!(f, "operation would block"),
            Error::NoMemory => write!(f, "out of memory"),
            Error::Unreachable => write!(f, "no address candidate succeeded"),
            Error::BadArgument => write!(f, "invalid argument"),
            Error::NotFound => write!(f, "handle not found"),
            Error::Closed => write!(f, "component already stopped"),
            Error::Sys(e) => write!(f, "system error: {}", e),
        }
    }
}

impl std::error::Error for Error {}
