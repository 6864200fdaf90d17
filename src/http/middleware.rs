//! Middleware chain primitive and the bundled middleware set from spec
//! §4.6: Logger, CORS, Basic auth, Bearer auth, Body limit, Rate limit,
//! Error handler.
//!
//! No teacher module composes request handlers (mio is transport-only);
//! the chain/`next()` shape is built fresh. The sliding-window rate
//! limiter's per-key deque is the same shape as `stream::WriteQueue`'s
//! `VecDeque` bookkeeping, just keyed by client IP instead of by handle.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use log::info;

use super::{Request, Response, StatusCode};

/// Per-request context threaded through a middleware chain: the parsed
/// request, the response being built, and an open user-data slot for
/// handlers to pass state to later links.
pub struct Context {
    pub request: Request,
    pub response: Response,
    pub client_addr: String,
    user_data: HashMap<String, String>,
}

impl Context {
    pub fn new(request: Request, client_addr: String) -> Self {
        Context {
            request,
            response: Response::default(),
            client_addr,
            user_data: HashMap::new(),
        }
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.user_data.insert(key.into(), value.into());
    }

    pub fn data(&self, key: &str) -> Option<&str> {
        self.user_data.get(key).map(String::as_str)
    }
}

/// A single link in the chain. Call `chain.next(ctx)` to continue, or
/// return without calling it to short-circuit.
pub trait Handler {
    fn call(&self, ctx: &mut Context, chain: &mut Chain<'_>);
}

impl<F: Fn(&mut Context, &mut Chain<'_>)> Handler for F {
    fn call(&self, ctx: &mut Context, chain: &mut Chain<'_>) {
        self(ctx, chain)
    }
}

/// An ordered sequence of handlers. `next()` advances to and invokes the
/// next link; calling it twice, or not at all, is the caller's choice —
/// the chain enforces nothing beyond bounds.
pub struct Chain<'a> {
    handlers: &'a [&'a dyn Handler],
    pos: usize,
}

impl<'a> Chain<'a> {
    pub fn new(handlers: &'a [&'a dyn Handler]) -> Self {
        Chain { handlers, pos: 0 }
    }

    /// Invokes the next handler in the chain, if any. A no-op once the
    /// chain is exhausted, so a handler can unconditionally call `next`
    /// without checking position first.
    pub fn next(&mut self, ctx: &mut Context) {
        if self.pos >= self.handlers.len() {
            return;
        }
        let handler = self.handlers[self.pos];
        self.pos += 1;
        handler.call(ctx, self);
    }
}

/// Runs a full chain to completion against `ctx`.
pub fn run_chain(handlers: &[&dyn Handler], ctx: &mut Context) {
    let mut chain = Chain::new(handlers);
    chain.next(ctx);
}

/// Records `{client IP, method, path, version, status, bytes, duration,
/// referer, user-agent}` once the rest of the chain has completed.
pub struct Logger;

impl Handler for Logger {
    fn call(&self, ctx: &mut Context, chain: &mut Chain<'_>) {
        let started = std::time::Instant::now();
        chain.next(ctx);
        let elapsed = started.elapsed();
        let referer = ctx.request.header("referer").unwrap_or("-").to_string();
        let user_agent = ctx.request.header("user-agent").unwrap_or("-").to_string();
        info!(
            "{} {} {} {} {} {}b {:?} referer={} ua={}",
            ctx.client_addr,
            ctx.request.method_str(),
            ctx.request.path(),
            ctx.request.version_str(),
            ctx.response.status.code(),
            ctx.response.body.len(),
            elapsed,
            referer,
            user_agent,
        );
    }
}

/// Adds CORS headers; short-circuits preflight `OPTIONS` requests with 204.
pub struct Cors {
    pub allow_origin: String,
    pub allow_methods: String,
    pub allow_headers: String,
}

impl Default for Cors {
    fn default() -> Self {
        Cors {
            allow_origin: "*".to_string(),
            allow_methods: "GET, POST, PUT, DELETE, OPTIONS".to_string(),
            allow_headers: "Content-Type, Authorization".to_string(),
        }
    }
}

impl Handler for Cors {
    fn call(&self, ctx: &mut Context, chain: &mut Chain<'_>) {
        ctx.response
            .set_header("Access-Control-Allow-Origin", &self.allow_origin);
        ctx.response
            .set_header("Access-Control-Allow-Methods", &self.allow_methods);
        ctx.response
            .set_header("Access-Control-Allow-Headers", &self.allow_headers);
        if ctx.request.method_str() == "OPTIONS" {
            ctx.response.status = StatusCode(204);
            return;
        }
        chain.next(ctx);
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Parses `Authorization: Basic <b64>`, compares constant-time to a
/// configured `user:pass`. 401 on mismatch or missing header.
pub struct BasicAuth {
    pub credentials: String, // "user:pass", pre-encoded comparison target
}

impl BasicAuth {
    pub fn new(user: &str, pass: &str) -> Self {
        BasicAuth {
            credentials: format!("{user}:{pass}"),
        }
    }

    fn unauthorized(ctx: &mut Context) {
        ctx.response.status = StatusCode(401);
        ctx.response
            .set_header("WWW-Authenticate", "Basic realm=\"restricted\"");
    }
}

impl Handler for BasicAuth {
    fn call(&self, ctx: &mut Context, chain: &mut Chain<'_>) {
        use base64::Engine;
        let header = ctx.request.header("authorization").unwrap_or("");
        let Some(encoded) = header.strip_prefix("Basic ") else {
            Self::unauthorized(ctx);
            return;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            Self::unauthorized(ctx);
            return;
        };
        if !constant_time_eq(&decoded, self.credentials.as_bytes()) {
            Self::unauthorized(ctx);
            return;
        }
        chain.next(ctx);
    }
}

/// Extracts `Authorization: Bearer <tok>`, delegates validation to a
/// predicate. 401 on false or a missing/malformed header.
pub struct BearerAuth<F: Fn(&str) -> bool> {
    pub validator: F,
}

impl<F: Fn(&str) -> bool> Handler for BearerAuth<F> {
    fn call(&self, ctx: &mut Context, chain: &mut Chain<'_>) {
        let header = ctx.request.header("authorization").unwrap_or("");
        let Some(token) = header.strip_prefix("Bearer ") else {
            ctx.response.status = StatusCode(401);
            return;
        };
        if !(self.validator)(token.trim()) {
            ctx.response.status = StatusCode(401);
            return;
        }
        chain.next(ctx);
    }
}

/// Rejects requests whose declared `Content-Length` exceeds `max_bytes`
/// with 413, before the rest of the chain runs.
pub struct BodyLimit {
    pub max_bytes: u64,
}

impl Handler for BodyLimit {
    fn call(&self, ctx: &mut Context, chain: &mut Chain<'_>) {
        if let Some(len) = ctx.request.content_length() {
            if len > self.max_bytes {
                ctx.response.status = StatusCode(413);
                return;
            }
        }
        chain.next(ctx);
    }
}

/// Sliding-window rate limiter, keyed by client IP: a deque of request
/// timestamps per key, trimmed to `window` on every request.
pub struct RateLimit {
    window: Duration,
    max_requests: usize,
    hits: std::cell::RefCell<HashMap<String, VecDeque<std::time::Instant>>>,
}

impl RateLimit {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        RateLimit {
            window,
            max_requests,
            hits: std::cell::RefCell::new(HashMap::new()),
        }
    }
}

impl Handler for RateLimit {
    fn call(&self, ctx: &mut Context, chain: &mut Chain<'_>) {
        let now = std::time::Instant::now();
        let mut hits = self.hits.borrow_mut();
        let deque = hits.entry(ctx.client_addr.clone()).or_default();
        while let Some(&front) = deque.front() {
            if now.duration_since(front) > self.window {
                deque.pop_front();
            } else {
                break;
            }
        }
        if deque.len() >= self.max_requests {
            let oldest = *deque.front().unwrap();
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            ctx.response.status = StatusCode(429);
            ctx.response.set_header("Retry-After", &secs.to_string());
            return;
        }
        deque.push_back(now);
        drop(hits);
        chain.next(ctx);
    }
}

/// After the chain completes, if `status >= 400` and the body is empty,
/// writes a default plain-text message.
pub struct ErrorHandler;

impl Handler for ErrorHandler {
    fn call(&self, ctx: &mut Context, chain: &mut Chain<'_>) {
        chain.next(ctx);
        if ctx.response.status.code() >= 400 && ctx.response.body.is_empty() {
            ctx.response
                .set_header("Content-Type", "text/plain; charset=utf-8");
            ctx.response.body = ctx.response.status.reason_phrase().as_bytes().to_vec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, Request, Version};
    use std::time::Duration;

    fn req(method: Method) -> Request {
        Request::new(method, Version::Http11, "/".to_string(), Vec::new(), Vec::new())
    }

    fn ok_200(ctx: &mut Context, _chain: &mut Chain<'_>) {
        ctx.response.status = StatusCode(200);
    }

    fn err_404(ctx: &mut Context, _chain: &mut Chain<'_>) {
        ctx.response.status = StatusCode(404);
    }

    #[test]
    fn cors_preflight_short_circuits_with_204() {
        let cors = Cors::default();
        let mut ctx = Context::new(req(Method::Options), "127.0.0.1".to_string());
        let handlers: Vec<&dyn Handler> = vec![];
        let mut chain = Chain::new(&handlers);
        cors.call(&mut ctx, &mut chain);
        assert_eq!(ctx.response.status.code(), 204);
    }

    #[test]
    fn basic_auth_rejects_missing_header() {
        let auth = BasicAuth::new("alice", "secret");
        let mut ctx = Context::new(req(Method::Get), "127.0.0.1".to_string());
        let handlers: Vec<&dyn Handler> = vec![];
        let mut chain = Chain::new(&handlers);
        auth.call(&mut ctx, &mut chain);
        assert_eq!(ctx.response.status.code(), 401);
    }

    #[test]
    fn basic_auth_accepts_matching_credentials() {
        use base64::Engine;
        let auth = BasicAuth::new("alice", "secret");
        let mut ctx = Context::new(req(Method::Get), "127.0.0.1".to_string());
        let encoded = base64::engine::general_purpose::STANDARD.encode("alice:secret");
        ctx.request.set_header("authorization", &format!("Basic {encoded}"));
        let handlers: Vec<&dyn Handler> = vec![&ok_200];
        let mut chain = Chain::new(&handlers);
        auth.call(&mut ctx, &mut chain);
        assert_eq!(ctx.response.status.code(), 200);
    }

    #[test]
    fn body_limit_rejects_oversized_declared_length() {
        let limit = BodyLimit { max_bytes: 10 };
        let mut ctx = Context::new(req(Method::Post), "127.0.0.1".to_string());
        ctx.request.set_header("content-length", "11");
        let handlers: Vec<&dyn Handler> = vec![];
        let mut chain = Chain::new(&handlers);
        limit.call(&mut ctx, &mut chain);
        assert_eq!(ctx.response.status.code(), 413);
    }

    #[test]
    fn rate_limit_permits_up_to_max_then_429s() {
        let limiter = RateLimit::new(Duration::from_secs(60), 2);
        for _ in 0..2 {
            let mut ctx = Context::new(req(Method::Get), "1.2.3.4".to_string());
            let handlers: Vec<&dyn Handler> = vec![&ok_200];
            let mut chain = Chain::new(&handlers);
            limiter.call(&mut ctx, &mut chain);
            assert_eq!(ctx.response.status.code(), 200);
        }
        let mut ctx = Context::new(req(Method::Get), "1.2.3.4".to_string());
        let handlers: Vec<&dyn Handler> = vec![];
        let mut chain = Chain::new(&handlers);
        limiter.call(&mut ctx, &mut chain);
        assert_eq!(ctx.response.status.code(), 429);
        assert!(ctx.response.headers.iter().any(|(k, _)| k == "Retry-After"));
    }

    #[test]
    fn error_handler_fills_default_body_on_empty_error_response() {
        let handler = ErrorHandler;
        let mut ctx = Context::new(req(Method::Get), "127.0.0.1".to_string());
        let handlers: Vec<&dyn Handler> = vec![&err_404];
        let mut chain = Chain::new(&handlers);
        handler.call(&mut ctx, &mut chain);
        assert!(!ctx.response.body.is_empty());
        assert!(ctx
            .response
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Type" && v.contains("text/plain")));
    }
}
