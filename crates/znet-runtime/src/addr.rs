//! Address resolution
//!
//! Blocking `getaddrinfo` and a worker-thread-dispatched variant that
//! delivers its result through a callback on the resolving thread.

use std::ffi::CString;
use std::ptr;
use std::thread;

use znet_core::error::{Error, Result};
use znet_core::pool::ThreadPool;

/// Address family restriction for a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Family {
    #[default]
    Any,
    V4,
    V6,
}

impl Family {
    fn to_af(self) -> libc::c_int {
        match self {
            Family::Any => libc::AF_UNSPEC,
            Family::V4 => libc::AF_INET,
            Family::V6 => libc::AF_INET6,
        }
    }
}

/// Lookup hints. Service strings are always numeric ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hints {
    pub family: Family,
    /// Wildcard address for listening sockets (`AI_PASSIVE`)
    pub passive: bool,
    /// Hostname is a literal address; skip DNS (`AI_NUMERICHOST`)
    pub numeric_host: bool,
}

/// One resolved candidate address.
#[derive(Clone, Copy)]
pub struct AddrInfo {
    pub family: libc::c_int,
    pub socktype: libc::c_int,
    pub protocol: libc::c_int,
    pub addr: libc::sockaddr_storage,
    pub addrlen: libc::socklen_t,
}

impl std::fmt::Debug for AddrInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddrInfo")
            .field("family", &self.family)
            .field("addrlen", &self.addrlen)
            .finish()
    }
}

/// Blocking resolution. At least one of `hostname`/`service` required.
pub fn lookup(
    hostname: Option<&str>,
    service: Option<&str>,
    hints: &Hints,
) -> Result<Vec<AddrInfo>> {
    if hostname.is_none() && service.is_none() {
        return Err(Error::BadArgument);
    }
    let host = hostname
        .map(CString::new)
        .transpose()
        .map_err(|_| Error::BadArgument)?;
    let serv = service
        .map(CString::new)
        .transpose()
        .map_err(|_| Error::BadArgument)?;

    let mut raw_hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    raw_hints.ai_family = hints.family.to_af();
    raw_hints.ai_socktype = libc::SOCK_STREAM;
    raw_hints.ai_protocol = libc::IPPROTO_TCP;
    raw_hints.ai_flags = libc::AI_V4MAPPED
        | libc::AI_NUMERICSERV
        | if hints.passive { libc::AI_PASSIVE } else { 0 }
        | if hints.numeric_host {
            libc::AI_NUMERICHOST
        } else {
            0
        };

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    let err = unsafe {
        libc::getaddrinfo(
            host.as_ref().map_or(ptr::null(), |h| h.as_ptr()),
            serv.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            &raw_hints,
            &mut res,
        )
    };
    if err != 0 {
        return Err(match err {
            libc::EAI_MEMORY => Error::NoMemory,
            _ => Error::Unreachable,
        });
    }

    let mut out = Vec::new();
    let mut cur = res;
    while !cur.is_null() {
        let info = unsafe { &*cur };
        if !info.ai_addr.is_null() {
            let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let len = (info.ai_addrlen as usize)
                .min(std::mem::size_of::<libc::sockaddr_storage>());
            unsafe {
                ptr::copy_nonoverlapping(
                    info.ai_addr as *const u8,
                    &mut addr as *mut libc::sockaddr_storage as *mut u8,
                    len,
                );
            }
            out.push(AddrInfo {
                family: info.ai_family,
                socktype: info.ai_socktype,
                protocol: info.ai_protocol,
                addr,
                addrlen: len as libc::socklen_t,
            });
        }
        cur = info.ai_next;
    }
    unsafe { libc::freeaddrinfo(res) };

    if out.is_empty() {
        return Err(Error::Unreachable);
    }
    Ok(out)
}

/// An asynchronous lookup request. The callback must not resubmit the
/// same request from inside itself.
pub struct LookupRequest {
    pub hostname: Option<String>,
    pub service: Option<String>,
    pub hints: Hints,
}

/// Dispatch a lookup onto `pool` (or a detached thread when `None`); the
/// callback runs on the resolving thread with the request and result.
pub fn lookup_async(
    request: LookupRequest,
    pool: Option<&ThreadPool>,
    callback: impl FnOnce(LookupRequest, Result<Vec<AddrInfo>>) + Send + 'static,
) -> Result<()> {
    let job = move || {
        let result = lookup(
            request.hostname.as_deref(),
            request.service.as_deref(),
            &request.hints,
        );
        callback(request, result);
    };
    match pool {
        Some(pool) => pool.add(job),
        None => {
            thread::Builder::new()
                .name("znet-gai".into())
                .spawn(job)
                .map_err(Error::from)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn numeric_v4_lookup() {
        let hints = Hints {
            family: Family::V4,
            numeric_host: true,
            ..Default::default()
        };
        let addrs = lookup(Some("127.0.0.1"), Some("80"), &hints).unwrap();
        assert!(!addrs.is_empty());
        assert_eq!(addrs[0].family, libc::AF_INET);
        assert_eq!(addrs[0].socktype, libc::SOCK_STREAM);
    }

    #[test]
    fn passive_wildcard_lookup() {
        let hints = Hints {
            family: Family::V4,
            passive: true,
            ..Default::default()
        };
        let addrs = lookup(None, Some("0"), &hints).unwrap();
        assert!(!addrs.is_empty());
    }

    #[test]
    fn missing_both_arguments() {
        assert_eq!(
            lookup(None, None, &Hints::default()).unwrap_err(),
            Error::BadArgument
        );
    }

    #[test]
    fn async_lookup_delivers_on_worker() {
        let (tx, rx) = mpsc::channel();
        lookup_async(
            LookupRequest {
                hostname: Some("127.0.0.1".into()),
                service: Some("80".into()),
                hints: Hints {
                    family: Family::V4,
                    numeric_host: true,
                    ..Default::default()
                },
            },
            None,
            move |request, result| {
                assert_eq!(request.hostname.as_deref(), Some("127.0.0.1"));
                tx.send(result.map(|a| a.len())).unwrap();
            },
        )
        .unwrap();

        let got = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(got.unwrap() >= 1);
    }
}
