//! Thin HTTP/1.1 server glue over `znet-tcp`
//!
//! Each accepted connection accumulates bytes, parses complete
//! requests, and answers them through the user's [`HttpHandler`].
//! Keep-alive is the default; `Connection: close` or a parse error
//! gracefully closes the connection.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use znet_core::error::Result;
use znet_core::storage::DataFrame;
use znet_runtime::addr::Family;
use znet_runtime::reactor::AsyncLoop;
use znet_tcp::{
    ChildConfig, ReadState, Server, ServerEvent, ServerHandler, ServerOptions, Socket,
    SocketEvent, SocketHandler,
};

use crate::parse::{parse_request, Parsed};
use crate::serialize::write_response;
use crate::types::{Request, Response};

/// Produces a response per request. Runs on the reactor thread of the
/// connection's loop.
pub trait HttpHandler: Send + Sync {
    fn handle(&self, request: &Request) -> Response;
}

pub struct HttpServerOptions {
    pub event_loop: Arc<AsyncLoop>,
    pub hostname: Option<String>,
    pub port: u16,
    pub family: Family,
    pub backlog: i32,
}

/// A listening HTTP server.
pub struct HttpServer {
    server: Arc<Server>,
}

impl HttpServer {
    pub fn serve(options: HttpServerOptions, handler: Arc<dyn HttpHandler>) -> Result<HttpServer> {
        let server = Server::listen(
            ServerOptions {
                event_loop: options.event_loop,
                addrs: None,
                hostname: options.hostname,
                port: Some(options.port),
                family: options.family,
                backlog: options.backlog,
            },
            Arc::new(Acceptor { handler }),
        )?;
        Ok(HttpServer { server })
    }

    pub fn local_port(&self) -> Result<u16> {
        self.server.local_port()
    }

    pub fn close(&self) {
        self.server.close();
    }

    pub fn free(&self) {
        self.server.free();
    }
}

struct Acceptor {
    handler: Arc<dyn HttpHandler>,
}

impl ServerHandler for Acceptor {
    fn on_open(&self, _server: &Arc<Server>, child: &mut ChildConfig) -> bool {
        child.handler = Some(Arc::new(Conn {
            handler: self.handler.clone(),
            buf: Mutex::new(Vec::new()),
        }));
        true
    }

    fn on_event(&self, _server: &Arc<Server>, _event: ServerEvent) {}
}

struct Conn {
    handler: Arc<dyn HttpHandler>,
    buf: Mutex<Vec<u8>>,
}

impl Conn {
    /// Parse and answer every complete request in the buffer. False
    /// when the connection should stop reading.
    fn pump(&self, socket: &Arc<Socket>) -> bool {
        let mut buf = self.buf.lock();
        loop {
            match parse_request(&buf) {
                Ok(Parsed::Incomplete) => return true,
                Ok(Parsed::Done { message, consumed }) => {
                    buf.drain(..consumed);
                    let response = self.handler.handle(&message);
                    let bytes = write_response(&response);
                    if socket.send(DataFrame::bytes(bytes).free_on_err()).is_err() {
                        return false;
                    }
                    if message.wants_close() {
                        socket.close();
                        return false;
                    }
                }
                Err(e) => {
                    debug!("http: parse error: {}", e);
                    let bytes = write_response(&Response::new(400));
                    let _ = socket.send(DataFrame::bytes(bytes).free_on_err());
                    socket.close();
                    buf.clear();
                    return false;
                }
            }
        }
    }
}

impl SocketHandler for Conn {
    fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent) {
        match event {
            SocketEvent::Data => {
                let mut chunk = [0u8; 8192];
                loop {
                    let (n, state) = socket.read(&mut chunk);
                    if n > 0 {
                        self.buf.lock().extend_from_slice(&chunk[..n]);
                    }
                    match state {
                        ReadState::Filled => continue,
                        ReadState::WouldBlock => break,
                        ReadState::Eof | ReadState::Err(_) => {
                            socket.close();
                            break;
                        }
                    }
                }
                self.pump(socket);
            }
            SocketEvent::ReadClose => socket.close(),
            SocketEvent::Close { .. } => socket.free(),
            _ => {}
        }
    }
}
