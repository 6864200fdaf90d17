//! HTTP/1.x framer, request/response types, router, and middleware chain,
//! per spec §4.6.
//!
//! Grounded on rask-old's `h1` parser crate for the incremental-parse shape
//! (method/token classification) and on `stream::tcp::TcpStream` for the
//! non-blocking transport the server connection drives; the router and
//! middleware chain have no teacher counterpart and are built fresh (see
//! `router.rs`/`middleware.rs`).

mod middleware;
mod parser;
mod router;
mod server;

pub use middleware::{
    BasicAuth, BearerAuth, BodyLimit, Chain, Context, Cors, ErrorHandler, Handler, Logger,
    RateLimit,
};
pub use parser::{Method, ParserHandler, Parser, Version};
pub use router::{Matched, Router};
pub use server::{HttpServer, ServerConfig};

/// An HTTP status code and its canonical reason phrase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
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
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode(200)
    }
}

/// A fully assembled incoming request. Built by accumulating a [`Parser`]'s
/// callbacks over the lifetime of one message.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    version: Version,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Request {
    pub fn new(
        method: Method,
        version: Version,
        path: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Self {
        Request {
            method,
            version,
            path,
            headers,
            body,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn method_str(&self) -> &'static str {
        match self.method {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }

    pub fn version_str(&self) -> &'static str {
        match self.version {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Case-insensitive header lookup; returns the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

/// An outgoing response under construction. Handlers mutate `status`,
/// `headers`, and `body` directly; the server connection serializes the
/// status line, headers, and body once the chain completes.
#[derive(Clone, Debug, Default)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(existing) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            existing.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    /// Serializes the status line, headers, and body into `HTTP/1.1`
    /// wire format. `Content-Length` is always set from the actual body
    /// length, overriding anything a handler set manually.
    pub fn serialize(&self, version: Version) -> Vec<u8> {
        let version_str = match version {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        };
        let mut out = format!(
            "{} {} {}\r\n",
            version_str,
            self.status.code(),
            self.status.reason_phrase()
        )
        .into_bytes();
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}
