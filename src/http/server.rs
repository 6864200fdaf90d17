//! Drives [`crate::stream::tcp::TcpListener`]/`TcpStream` with the
//! incremental parser, router, and middleware chain to form a minimal
//! HTTP/1.x server, per spec §4.6.
//!
//! The accept/read dispatch itself is `stream::tcp`'s; this module only
//! adds the per-connection parser-accumulator and request/response
//! serialization on top, the same layering rask-old's `Listener` uses over
//! its own `mio`-registered sockets, generalized to go through a router
//! instead of one fixed handler.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use log::warn;

use crate::loop_::SharedLoop;
use crate::stream::tcp::{TcpListener, TcpStream};
use crate::Error;

use super::middleware::{run_chain, Context, Handler};
use super::parser::{Method, Parser, ParserHandler, Version};
use super::router::Router;
use super::{Request, Response};

/// Server-wide tuning knobs.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Upper bound on accumulated request body bytes, independent of any
    /// `BodyLimit` middleware (that one rejects on declared length; this
    /// one is a hard cap on what the parser will actually accumulate).
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Default)]
struct RequestAccumulator {
    url: Vec<u8>,
    cur_field: Vec<u8>,
    cur_value: Vec<u8>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    headers_complete: bool,
    message_complete: bool,
    error: bool,
}

impl RequestAccumulator {
    fn flush_header(&mut self) {
        if !self.cur_field.is_empty() {
            let name = String::from_utf8_lossy(&self.cur_field).into_owned();
            let value = String::from_utf8_lossy(&self.cur_value).into_owned();
            self.headers.push((name, value));
            self.cur_field.clear();
            self.cur_value.clear();
        }
    }

    fn reset(&mut self) {
        self.url.clear();
        self.cur_field.clear();
        self.cur_value.clear();
        self.headers.clear();
        self.body.clear();
        self.headers_complete = false;
        self.message_complete = false;
        self.error = false;
    }
}

impl ParserHandler for RequestAccumulator {
    fn on_url(&mut self, data: &[u8]) {
        self.url.extend_from_slice(data);
    }

    fn on_header_field(&mut self, data: &[u8]) {
        self.flush_header();
        self.cur_field.extend_from_slice(data);
    }

    fn on_header_value(&mut self, data: &[u8]) {
        self.cur_value.extend_from_slice(data);
    }

    fn on_headers_complete(&mut self) {
        self.flush_header();
        self.headers_complete = true;
    }

    fn on_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    fn on_message_complete(&mut self) {
        self.message_complete = true;
    }
}

/// An HTTP/1.x server bound to one [`SharedLoop`]. Holds the router and
/// global middleware chain for the lifetime of the listener; every
/// accepted connection shares them by `Rc`.
pub struct HttpServer {
    listener: TcpListener,
    inner: Rc<ServerInner>,
}

struct ServerInner {
    router: Router<Box<dyn Handler>>,
    globals: Vec<Box<dyn Handler>>,
    config: ServerConfig,
}

impl HttpServer {
    pub fn bind(
        loop_: SharedLoop,
        addr: SocketAddr,
        router: Router<Box<dyn Handler>>,
        globals: Vec<Box<dyn Handler>>,
        config: ServerConfig,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(loop_, addr)?;
        Ok(HttpServer {
            listener,
            inner: Rc::new(ServerInner {
                router,
                globals,
                config,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr()
    }

    /// Starts accepting connections and serving requests on each.
    pub fn listen(&self) -> Result<(), Error> {
        let inner = self.inner.clone();
        self.listener.listen(Box::new(move |result| match result {
            Ok(stream) => serve_connection(stream, inner.clone()),
            Err(e) => warn!("accept failed: {e}"),
        }))
    }

    pub fn close(&self) {
        self.listener.close();
    }
}

fn serve_connection(stream: TcpStream, inner: Rc<ServerInner>) {
    let client_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let parser = Rc::new(RefCell::new(Parser::new()));
    let acc = Rc::new(RefCell::new(RequestAccumulator::default()));
    let stream = Rc::new(stream);

    let result = {
        let stream = stream.clone();
        let parser = parser.clone();
        let acc = acc.clone();
        let inner = inner.clone();
        let client_addr = client_addr.clone();

        stream.read_start(
            Box::new(|suggested| vec![0u8; suggested.min(64 * 1024)]),
            Box::new(move |read_result, buf| {
                let n = match read_result {
                    Ok(0) | Err(_) => {
                        stream.close(None);
                        return;
                    }
                    Ok(n) => n,
                };

                let mut offset = 0;
                while offset < n {
                    let mut p = parser.borrow_mut();
                    let mut a = acc.borrow_mut();
                    if a.body.len() > inner.config.max_body_bytes {
                        a.error = true;
                    }
                    if a.error || p.is_error() {
                        drop(p);
                        drop(a);
                        stream.close(None);
                        return;
                    }
                    let consumed = match p.feed(&buf[offset..n], &mut *a) {
                        Ok(c) => c,
                        Err(_) => {
                            drop(p);
                            drop(a);
                            stream.close(None);
                            return;
                        }
                    };
                    offset += consumed;
                    if consumed == 0 && !a.message_complete {
                        // Parser made no progress on a non-empty slice and
                        // isn't mid-message-completion; nothing more to feed
                        // until the next readable event.
                        break;
                    }

                    if a.message_complete {
                        let method = p.method().unwrap_or(Method::Get);
                        let version = p.version().unwrap_or(Version::Http11);
                        let path = String::from_utf8_lossy(&a.url).into_owned();
                        let headers = a.headers.clone();
                        let body = a.body.clone();
                        let keep_alive = !headers
                            .iter()
                            .any(|(k, v)| k.eq_ignore_ascii_case("connection") && v.eq_ignore_ascii_case("close"));
                        p.reset();
                        a.reset();
                        drop(p);
                        drop(a);

                        let request = Request::new(method, version, path, headers, body);
                        let response = dispatch(&inner, request, &client_addr);
                        let wire = response.serialize(version);
                        let stream_for_write = stream.clone();
                        let _ = stream.write(
                            Bytes::from(wire),
                            Box::new(move |_| {
                                if !keep_alive {
                                    stream_for_write.close(None);
                                }
                            }),
                        );
                    }
                }
            }),
        )
    };

    if let Err(e) = result {
        warn!("failed to start reading from accepted connection: {e}");
    }
}

fn dispatch(inner: &ServerInner, request: Request, client_addr: &str) -> Response {
    let method = request.method();
    let path = request.path().to_string();
    let mut ctx = Context::new(request, client_addr.to_string());

    let matched = inner.router.route(method, &path);
    let mut refs: Vec<&dyn Handler> = inner.globals.iter().map(|b| b.as_ref()).collect();
    if let Some(m) = &matched {
        for (name, value) in &m.params {
            ctx.set_data(format!("param:{name}"), value.clone());
        }
        refs.push(m.handler.as_ref());
    } else {
        ctx.response.status = super::StatusCode(404);
    }

    if !refs.is_empty() {
        run_chain(&refs, &mut ctx);
    }

    ctx.response
}
