//! HTTP/1.1 serialization

use crate::types::{Request, Response};

/// Canonical reason phrase for a status code.
pub fn status_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        418 => "I'm a Teapot",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

fn has_framing(headers: &[crate::types::Header]) -> bool {
    headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("Content-Length")
            || h.name.eq_ignore_ascii_case("Transfer-Encoding")
    })
}

/// Serialize a request, adding `Content-Length` for a non-empty body
/// unless the caller framed it already.
pub fn write_request(request: &Request) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + request.body.len());
    out.extend_from_slice(request.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for header in &request.headers {
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !request.body.is_empty() && !has_framing(&request.headers) {
        out.extend_from_slice(format!("Content-Length: {}\r\n", request.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}

/// Serialize a response. `Content-Length` is always emitted unless the
/// caller declared its own framing.
pub fn write_response(response: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + response.body.len());
    let reason = if response.reason.is_empty() {
        status_reason(response.status)
    } else {
        response.reason.as_str()
    };
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", response.status, reason).as_bytes());
    for header in &response.headers {
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !has_framing(&response.headers) {
        out.extend_from_slice(format!("Content-Length: {}\r\n", response.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&response.body);
    out
}

/// Encode one chunk of a chunked body; a zero-length slice encodes the
/// terminator.
pub fn write_chunk(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return b"0\r\n\r\n".to_vec();
    }
    let mut out = Vec::with_capacity(data.len() + 16);
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{parse_request, parse_response, Parsed};
    use crate::types::{Header, Method};

    #[test]
    fn request_serializes_and_reparses() {
        let mut request = Request::new(Method::Post, "/submit");
        request.headers.push(Header {
            name: "Host".into(),
            value: "example.com".into(),
        });
        request.body = b"payload".to_vec();

        let raw = write_request(&request);
        match parse_request(&raw).unwrap() {
            Parsed::Done { message, consumed } => {
                assert_eq!(consumed, raw.len());
                assert_eq!(message.method, Method::Post);
                assert_eq!(message.body, b"payload");
                assert_eq!(message.header("Content-Length"), Some("7"));
            }
            Parsed::Incomplete => panic!("incomplete"),
        }
    }

    #[test]
    fn response_serializes_and_reparses() {
        let response = Response::with_body(200, &b"ok"[..]);
        let raw = write_response(&response);
        assert!(raw.starts_with(b"HTTP/1.1 200 OK\r\n"));
        match parse_response(&raw).unwrap() {
            Parsed::Done { message, .. } => {
                assert_eq!(message.status, 200);
                assert_eq!(message.body, b"ok");
            }
            Parsed::Incomplete => panic!("incomplete"),
        }
    }

    #[test]
    fn chunk_encoding_matches_parser() {
        let mut raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        raw.extend_from_slice(&write_chunk(b"Wiki"));
        raw.extend_from_slice(&write_chunk(b"pedia"));
        raw.extend_from_slice(&write_chunk(b""));
        match parse_request(&raw).unwrap() {
            Parsed::Done { message, .. } => assert_eq!(message.body, b"Wikipedia"),
            Parsed::Incomplete => panic!("incomplete"),
        }
    }

    #[test]
    fn unknown_status_reason() {
        assert_eq!(status_reason(299), "Unknown");
        assert_eq!(status_reason(418), "I'm a Teapot");
    }
}
