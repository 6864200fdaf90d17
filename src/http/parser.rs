//! An incremental, re-entrant HTTP/1.x request parser: a single byte-driven
//! state machine that fires boundary callbacks exactly once per crossing,
//! resumable across arbitrary feed-call chunking.
//!
//! Token classification (valid method characters, request-target
//! characters) is grounded on rask-old's `parser::h1::tokens` module; the
//! incremental re-entrancy itself has no teacher counterpart — rask-old's
//! own `H1Request::parse` assumes the whole message is already buffered
//! (see its own `TODO` about multi-packet requests) — so the state machine
//! here is built fresh against spec §4.6's callback contract.

use crate::{Error, ErrorKind};

/// HTTP request methods this parser recognizes. An unrecognized method
/// token is a parse error, not a catch-all variant — per spec, "a
/// syntactically invalid token transitions to a terminal error state."
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    fn from_bytes(b: &[u8]) -> Option<Method> {
        match b {
            b"GET" => Some(Method::Get),
            b"HEAD" => Some(Method::Head),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"CONNECT" => Some(Method::Connect),
            b"OPTIONS" => Some(Method::Options),
            b"TRACE" => Some(Method::Trace),
            b"PATCH" => Some(Method::Patch),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Version {
    Http10,
    Http11,
}

/// Callbacks fired as the parser crosses message boundaries. All methods
/// have no-op defaults so a handler only overrides what it needs, the same
/// shape as the classic `http_parser`/`llhttp` settings struct, adapted to
/// a Rust trait.
pub trait ParserHandler {
    fn on_message_begin(&mut self) {}
    /// May fire more than once per request line; concatenate slices to
    /// reconstruct the full target.
    fn on_url(&mut self, _data: &[u8]) {}
    /// Always followed by one or more `on_header_value` calls before the
    /// next `on_header_field` or `on_headers_complete`.
    fn on_header_field(&mut self, _data: &[u8]) {}
    fn on_header_value(&mut self, _data: &[u8]) {}
    fn on_headers_complete(&mut self) {}
    fn on_body(&mut self, _data: &[u8]) {}
    fn on_message_complete(&mut self) {}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Method,
    Uri,
    Version,
    RequestLineLf,
    HeaderLineStart,
    HeaderName,
    HeaderColon,
    HeaderValue,
    HeaderValueLf,
    EndOfHeadersLf,
    BodyIdentity,
    ChunkSizeStart,
    ChunkSize,
    ChunkExt,
    ChunkSizeLf,
    ChunkData,
    ChunkDataLf,
    ChunkCrlfAfterData,
    MessageComplete,
    Error,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BodyMode {
    None,
    Identity,
    Chunked,
}

/// An incremental HTTP/1.x request parser. One instance is reused across
/// every request on a connection via [`Parser::reset`].
pub struct Parser {
    state: State,
    scratch: Vec<u8>,
    method: Option<Method>,
    version: Option<Version>,
    body_mode: BodyMode,
    remaining: u64,
    saw_content_length: bool,
    saw_transfer_encoding: bool,
    content_length: u64,
    transfer_encoding_chunked: bool,
    header_name_lower: Vec<u8>,
    header_value_buf: Vec<u8>,
    in_trailers: bool,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

const MAX_TOKEN_SCRATCH: usize = 24;
const MAX_HEADER_NAME_TRACK: usize = 24;
const MAX_HEADER_VALUE_TRACK: usize = 32;

impl Parser {
    pub fn new() -> Self {
        Parser {
            state: State::Method,
            scratch: Vec::new(),
            method: None,
            version: None,
            body_mode: BodyMode::None,
            remaining: 0,
            saw_content_length: false,
            saw_transfer_encoding: false,
            content_length: 0,
            transfer_encoding_chunked: false,
            header_name_lower: Vec::new(),
            header_value_buf: Vec::new(),
            in_trailers: false,
        }
    }

    /// Resets the parser to parse the next message on the same connection.
    /// Only valid once the previous message reached `on_message_complete`
    /// (or the parser was never fed).
    pub fn reset(&mut self) {
        self.state = State::Method;
        self.scratch.clear();
        self.method = None;
        self.version = None;
        self.body_mode = BodyMode::None;
        self.remaining = 0;
        self.saw_content_length = false;
        self.saw_transfer_encoding = false;
        self.content_length = 0;
        self.transfer_encoding_chunked = false;
        self.header_name_lower.clear();
        self.header_value_buf.clear();
        self.in_trailers = false;
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::MessageComplete
    }

    pub fn is_error(&self) -> bool {
        self.state == State::Error
    }

    /// Feeds `data` to the parser, firing `handler`'s callbacks for every
    /// boundary crossed. Returns the number of bytes consumed. Once the
    /// parser enters the error state it returns `Err` on every subsequent
    /// call without invoking any callback, per spec.
    pub fn feed(&mut self, data: &[u8], handler: &mut dyn ParserHandler) -> Result<usize, Error> {
        if self.state == State::Error {
            return Err(parse_error("parser already in error state"));
        }
        if self.state == State::Method && self.scratch.is_empty() {
            handler.on_message_begin();
        }

        let mut pos = 0;
        while pos < data.len() {
            match self.state {
                State::Method => pos = self.step_method(data, pos)?,
                State::Uri => pos = self.step_uri(data, pos, handler),
                State::Version => pos = self.step_version(data, pos)?,
                State::RequestLineLf => pos = self.step_request_line_lf(data, pos)?,
                State::HeaderLineStart => pos = self.step_header_line_start(data, pos, handler)?,
                State::HeaderName => pos = self.step_header_name(data, pos, handler),
                State::HeaderColon => pos = self.step_header_colon(data, pos),
                State::HeaderValue => pos = self.step_header_value(data, pos, handler),
                State::HeaderValueLf => pos = self.step_header_value_lf(data, pos)?,
                State::EndOfHeadersLf => pos = self.step_end_of_headers(data, pos, handler)?,
                State::BodyIdentity => pos = self.step_body_identity(data, pos, handler),
                State::ChunkSizeStart => pos = self.step_chunk_size_start(data, pos)?,
                State::ChunkSize => pos = self.step_chunk_size(data, pos)?,
                State::ChunkExt => pos = self.step_chunk_ext(data, pos),
                State::ChunkSizeLf => pos = self.step_chunk_size_lf(data, pos, handler)?,
                State::ChunkData => pos = self.step_chunk_data(data, pos, handler),
                State::ChunkDataLf => pos = self.step_chunk_data_lf(data, pos)?,
                State::ChunkCrlfAfterData => pos = self.step_chunk_crlf_after_data(data, pos)?,
                State::MessageComplete => return Ok(pos),
                State::Error => return Err(parse_error("parser already in error state")),
            }
        }
        Ok(pos)
    }

    fn fail(&mut self) -> Error {
        self.state = State::Error;
        parse_error("malformed HTTP/1.x message")
    }

    fn step_method(&mut self, data: &[u8], mut pos: usize) -> Result<usize, Error> {
        while pos < data.len() {
            let b = data[pos];
            if b == b' ' {
                let method = Method::from_bytes(&self.scratch).ok_or_else(|| self.fail());
                let method = method?;
                self.method = Some(method);
                self.scratch.clear();
                self.state = State::Uri;
                return Ok(pos + 1);
            }
            if !b.is_ascii_uppercase() || self.scratch.len() >= MAX_TOKEN_SCRATCH {
                return Err(self.fail());
            }
            self.scratch.push(b);
            pos += 1;
        }
        Ok(pos)
    }

    fn step_uri(&mut self, data: &[u8], pos: usize, handler: &mut dyn ParserHandler) -> usize {
        let start = pos;
        let mut i = pos;
        while i < data.len() {
            if data[i] == b' ' {
                if i > start {
                    handler.on_url(&data[start..i]);
                }
                self.state = State::Version;
                return i + 1;
            }
            i += 1;
        }
        if i > start {
            handler.on_url(&data[start..i]);
        }
        i
    }

    fn step_version(&mut self, data: &[u8], mut pos: usize) -> Result<usize, Error> {
        while pos < data.len() {
            let b = data[pos];
            if b == b'\r' {
                let version = match self.scratch.as_slice() {
                    b"HTTP/1.0" => Version::Http10,
                    b"HTTP/1.1" => Version::Http11,
                    _ => return Err(self.fail()),
                };
                self.version = Some(version);
                self.scratch.clear();
                self.state = State::RequestLineLf;
                return Ok(pos + 1);
            }
            if self.scratch.len() >= MAX_TOKEN_SCRATCH {
                return Err(self.fail());
            }
            self.scratch.push(b);
            pos += 1;
        }
        Ok(pos)
    }

    fn step_request_line_lf(&mut self, data: &[u8], pos: usize) -> Result<usize, Error> {
        if data[pos] != b'\n' {
            return Err(self.fail());
        }
        self.state = State::HeaderLineStart;
        Ok(pos + 1)
    }

    fn step_header_line_start(
        &mut self,
        data: &[u8],
        pos: usize,
        handler: &mut dyn ParserHandler,
    ) -> Result<usize, Error> {
        let b = data[pos];
        if b == b'\r' {
            // Blank line: end of headers (or trailers). Transition to a
            // dedicated state so a CR/LF split across feed() calls resumes
            // here rather than being mistaken for a header-value terminator.
            self.state = State::EndOfHeadersLf;
            return self.step_end_of_headers(data, pos + 1, handler);
        }
        self.header_name_lower.clear();
        self.state = State::HeaderName;
        Ok(pos)
    }

    fn step_end_of_headers(
        &mut self,
        data: &[u8],
        pos: usize,
        handler: &mut dyn ParserHandler,
    ) -> Result<usize, Error> {
        if pos >= data.len() {
            // Still need the trailing LF; state is already EndOfHeadersLf.
            return Ok(pos);
        }
        if data[pos] != b'\n' {
            return Err(self.fail());
        }
        let pos = pos + 1;
        if self.in_trailers {
            self.state = State::MessageComplete;
            handler.on_message_complete();
            return Ok(pos);
        }
        if self.saw_content_length && self.saw_transfer_encoding {
            return Err(self.fail());
        }
        handler.on_headers_complete();
        self.body_mode = if self.saw_transfer_encoding && self.transfer_encoding_chunked {
            BodyMode::Chunked
        } else if self.saw_content_length {
            if self.content_length == 0 {
                self.state = State::MessageComplete;
                handler.on_message_complete();
                return Ok(pos);
            }
            self.remaining = self.content_length;
            BodyMode::Identity
        } else {
            BodyMode::None
        };
        self.state = match self.body_mode {
            BodyMode::Identity => State::BodyIdentity,
            BodyMode::Chunked => State::ChunkSizeStart,
            BodyMode::None => {
                handler.on_message_complete();
                State::MessageComplete
            }
        };
        Ok(pos)
    }

    fn step_header_name(
        &mut self,
        data: &[u8],
        pos: usize,
        handler: &mut dyn ParserHandler,
    ) -> usize {
        let start = pos;
        let mut i = pos;
        while i < data.len() {
            if data[i] == b':' {
                if i > start {
                    handler.on_header_field(&data[start..i]);
                    self.track_header_name(&data[start..i]);
                }
                self.state = State::HeaderColon;
                return i + 1;
            }
            i += 1;
        }
        if i > start {
            handler.on_header_field(&data[start..i]);
            self.track_header_name(&data[start..i]);
        }
        i
    }

    fn track_header_name(&mut self, chunk: &[u8]) {
        for &b in chunk {
            if self.header_name_lower.len() < MAX_HEADER_NAME_TRACK {
                self.header_name_lower.push(b.to_ascii_lowercase());
            }
        }
    }

    fn step_header_colon(&mut self, data: &[u8], mut pos: usize) -> usize {
        while pos < data.len() && data[pos] == b' ' {
            pos += 1;
        }
        if pos < data.len() {
            self.header_value_buf.clear();
            self.state = State::HeaderValue;
        }
        pos
    }

    fn step_header_value(
        &mut self,
        data: &[u8],
        pos: usize,
        handler: &mut dyn ParserHandler,
    ) -> usize {
        let start = pos;
        let mut i = pos;
        while i < data.len() {
            if data[i] == b'\r' {
                if i > start {
                    handler.on_header_value(&data[start..i]);
                    self.track_header_value(&data[start..i]);
                }
                self.finish_header_value();
                self.state = State::HeaderValueLf;
                return i + 1;
            }
            i += 1;
        }
        if i > start {
            handler.on_header_value(&data[start..i]);
            self.track_header_value(&data[start..i]);
        }
        i
    }

    fn track_header_value(&mut self, chunk: &[u8]) {
        for &b in chunk {
            if self.header_value_buf.len() < MAX_HEADER_VALUE_TRACK {
                self.header_value_buf.push(b);
            }
        }
    }

    fn finish_header_value(&mut self) {
        if self.header_name_lower == b"content-length" {
            match std::str::from_utf8(&self.header_value_buf)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
            {
                Some(n) => {
                    if self.saw_content_length && self.content_length != n {
                        // Conflicting duplicate; surfaced as a parse error
                        // on the next byte via `saw_content_length` already
                        // being set combined with a mismatch flag would add
                        // state, so instead force transfer_encoding's
                        // conflict branch by treating a second differing
                        // value as equivalent to a framing conflict.
                        self.saw_transfer_encoding = true;
                        self.transfer_encoding_chunked = false;
                    }
                    self.content_length = n;
                    self.saw_content_length = true;
                }
                None => {
                    self.saw_content_length = true;
                    self.content_length = u64::MAX;
                }
            }
        } else if self.header_name_lower == b"transfer-encoding" {
            self.saw_transfer_encoding = true;
            let lower: Vec<u8> = self
                .header_value_buf
                .iter()
                .map(|b| b.to_ascii_lowercase())
                .collect();
            self.transfer_encoding_chunked = lower
                .windows(7)
                .any(|w| w == b"chunked");
        }
        self.header_name_lower.clear();
        self.header_value_buf.clear();
    }

    fn step_header_value_lf(&mut self, data: &[u8], pos: usize) -> Result<usize, Error> {
        if data[pos] != b'\n' {
            return Err(self.fail());
        }
        self.state = State::HeaderLineStart;
        Ok(pos + 1)
    }

    fn step_body_identity(
        &mut self,
        data: &[u8],
        pos: usize,
        handler: &mut dyn ParserHandler,
    ) -> usize {
        let available = (data.len() - pos) as u64;
        let take = available.min(self.remaining) as usize;
        if take > 0 {
            handler.on_body(&data[pos..pos + take]);
            self.remaining -= take as u64;
        }
        if self.remaining == 0 {
            self.state = State::MessageComplete;
            handler.on_message_complete();
        }
        pos + take
    }

    fn step_chunk_size_start(&mut self, data: &[u8], pos: usize) -> Result<usize, Error> {
        self.scratch.clear();
        self.state = State::ChunkSize;
        self.step_chunk_size(data, pos)
    }

    fn step_chunk_size(&mut self, data: &[u8], mut pos: usize) -> Result<usize, Error> {
        while pos < data.len() {
            let b = data[pos];
            if b.is_ascii_hexdigit() {
                if self.scratch.len() >= 16 {
                    return Err(self.fail());
                }
                self.scratch.push(b);
                pos += 1;
                continue;
            }
            if self.scratch.is_empty() {
                return Err(self.fail());
            }
            let size_str = std::str::from_utf8(&self.scratch).map_err(|_| self.fail_now())?;
            let size = u64::from_str_radix(size_str, 16).map_err(|_| self.fail_now())?;
            self.remaining = size;
            self.scratch.clear();
            self.state = if b == b';' { State::ChunkExt } else { State::ChunkSizeLf };
            return Ok(if b == b'\r' { pos + 1 } else { pos });
        }
        Ok(pos)
    }

    fn fail_now(&mut self) -> Error {
        self.state = State::Error;
        parse_error("malformed chunk size")
    }

    fn step_chunk_ext(&mut self, data: &[u8], mut pos: usize) -> usize {
        while pos < data.len() {
            if data[pos] == b'\r' {
                self.state = State::ChunkSizeLf;
                return pos + 1;
            }
            pos += 1;
        }
        pos
    }

    fn step_chunk_size_lf(
        &mut self,
        data: &[u8],
        pos: usize,
        handler: &mut dyn ParserHandler,
    ) -> Result<usize, Error> {
        if data[pos] != b'\n' {
            return Err(self.fail());
        }
        let pos = pos + 1;
        if self.remaining == 0 {
            // Terminal chunk: trailers (if any) follow, then the blank line.
            self.in_trailers = true;
            self.state = State::HeaderLineStart;
            return Ok(pos);
        }
        self.state = State::ChunkData;
        let _ = handler;
        Ok(pos)
    }

    fn step_chunk_data(&mut self, data: &[u8], pos: usize, handler: &mut dyn ParserHandler) -> usize {
        let available = (data.len() - pos) as u64;
        let take = available.min(self.remaining) as usize;
        if take > 0 {
            handler.on_body(&data[pos..pos + take]);
            self.remaining -= take as u64;
        }
        if self.remaining == 0 {
            self.state = State::ChunkDataLf;
        }
        pos + take
    }

    fn step_chunk_data_lf(&mut self, data: &[u8], pos: usize) -> Result<usize, Error> {
        if data[pos] != b'\r' {
            return Err(self.fail());
        }
        self.state = State::ChunkCrlfAfterData;
        Ok(pos + 1)
    }

    fn step_chunk_crlf_after_data(&mut self, data: &[u8], pos: usize) -> Result<usize, Error> {
        if data[pos] != b'\n' {
            return Err(self.fail());
        }
        self.state = State::ChunkSizeStart;
        Ok(pos + 1)
    }
}

// `Parser` additionally exposes the parsed request-line fields directly,
// since `on_url`/method/version aren't delivered through the callback trait
// (the trait only covers boundary-crossing events, per spec).
impl Parser {
    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }
}

fn parse_error(msg: &str) -> Error {
    Error::new(ErrorKind::ProtocolError, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        begun: u32,
        url: Vec<u8>,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
        cur_field: Vec<u8>,
        cur_value: Vec<u8>,
        body: Vec<u8>,
        headers_complete: bool,
        complete: u32,
    }

    impl Recorder {
        fn flush_header(&mut self) {
            if !self.cur_field.is_empty() {
                self.headers
                    .push((std::mem::take(&mut self.cur_field), std::mem::take(&mut self.cur_value)));
            }
        }
    }

    impl ParserHandler for Recorder {
        fn on_message_begin(&mut self) {
            self.begun += 1;
        }
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
            self.complete += 1;
        }
    }

    #[test]
    fn parses_simple_get() {
        let mut parser = Parser::new();
        let mut rec = Recorder::default();
        let req = b"GET /hello HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let n = parser.feed(req, &mut rec).unwrap();
        assert_eq!(n, req.len());
        assert!(parser.is_complete());
        assert_eq!(rec.url, b"/hello");
        assert_eq!(parser.method(), Some(Method::Get));
        assert_eq!(parser.version(), Some(Version::Http11));
        assert_eq!(rec.headers, vec![(b"Host".to_vec(), b"example.com".to_vec())]);
        assert_eq!(rec.complete, 1);
    }

    #[test]
    fn byte_at_a_time_feed_matches_whole_buffer_feed() {
        let req = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut whole_parser = Parser::new();
        let mut whole_rec = Recorder::default();
        whole_parser.feed(req, &mut whole_rec).unwrap();

        let mut byte_parser = Parser::new();
        let mut byte_rec = Recorder::default();
        for &b in req {
            byte_parser.feed(&[b], &mut byte_rec).unwrap();
        }

        assert_eq!(whole_rec.url, byte_rec.url);
        assert_eq!(whole_rec.body, byte_rec.body);
        assert_eq!(whole_rec.body, b"hello");
        assert!(byte_parser.is_complete());
    }

    #[test]
    fn invalid_method_enters_error_state() {
        let mut parser = Parser::new();
        let mut rec = Recorder::default();
        let err = parser.feed(b"get / HTTP/1.1\r\n\r\n", &mut rec);
        assert!(err.is_err());
        assert!(parser.is_error());
        assert!(parser.feed(b"more", &mut rec).is_err());
    }

    #[test]
    fn conflicting_length_and_chunked_is_an_error() {
        let mut parser = Parser::new();
        let mut rec = Recorder::default();
        let req = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert!(parser.feed(req, &mut rec).is_err());
    }

    #[test]
    fn chunked_body_decodes_across_chunks() {
        let mut parser = Parser::new();
        let mut rec = Recorder::default();
        let req = b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        parser.feed(req, &mut rec).unwrap();
        assert!(parser.is_complete());
        assert_eq!(rec.body, b"Wikipedia");
    }

    #[test]
    fn reset_allows_a_second_message_on_the_same_parser() {
        let mut parser = Parser::new();
        let mut rec = Recorder::default();
        parser.feed(b"GET /a HTTP/1.1\r\n\r\n", &mut rec).unwrap();
        assert!(parser.is_complete());
        parser.reset();
        let mut rec2 = Recorder::default();
        parser.feed(b"GET /b HTTP/1.1\r\n\r\n", &mut rec2).unwrap();
        assert!(parser.is_complete());
        assert_eq!(rec2.url, b"/b");
    }

    #[test]
    fn blank_line_crlf_split_across_feed_calls_still_completes_headers() {
        let mut parser = Parser::new();
        let mut rec = Recorder::default();
        let head = b"GET /x HTTP/1.1\r\nHost: a\r\n\r";
        let tail = b"\n";
        parser.feed(head, &mut rec).unwrap();
        assert!(!rec.headers_complete);
        parser.feed(tail, &mut rec).unwrap();
        assert!(rec.headers_complete);
        assert!(parser.is_complete());
        assert_eq!(rec.complete, 1);
    }
}
