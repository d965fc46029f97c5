//! # znet-tcp — TCP client and server state machines
//!
//! Builds the connection layer on top of `znet-runtime`'s reactor:
//! non-blocking connect with candidate walking, a per-connection send
//! queue with partial-write recovery, ordered half-close, deferred
//! teardown, and a listening-socket accept loop.

pub mod server;
pub mod socket;

pub use server::{ChildConfig, Server, ServerEvent, ServerHandler, ServerOptions};
pub use socket::{
    Options, ReadState, SendError, Settings, Socket, SocketEvent, SocketHandler,
};
