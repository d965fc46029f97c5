//! # znet-http — HTTP/1.1 over znet-tcp
//!
//! A byte-level HTTP/1.1 request/response parser and serializer, plus a
//! thin server glue that speaks them over the toolkit's TCP layer.
//! Bodies are carried as-is; `Content-Encoding` is recognized but never
//! transcoded here.

pub mod parse;
pub mod serialize;
pub mod server;
pub mod types;

pub use parse::{parse_request, parse_response, ParseError, Parsed};
pub use serialize::{status_reason, write_chunk, write_request, write_response};
pub use server::{HttpHandler, HttpServer, HttpServerOptions};
pub use types::{Encoding, Header, Method, Request, Response};
