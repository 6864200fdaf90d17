//! Incremental RESP2/3 parser, per spec §4.8: fed bytes may split any
//! CRLF or any byte of a bulk payload, and the parser yields exactly one
//! complete top-level value per call cycle — the same re-entrant,
//! byte-cursor shape as [`crate::http::parser::Parser`] and
//! [`crate::ws::frame::FrameParser`], generalized to a value stack instead
//! of a flat header list so arbitrarily nested arrays resolve correctly.

use crate::{Error, ErrorKind};

use super::value::Value;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TypeMarker {
    Simple,
    Error,
    Integer,
    Bulk,
    Array,
    Null,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    TypeByte,
    Line,
    LineLf,
    BulkBody,
    BulkCr,
    BulkLf,
    Failed,
}

struct ArrayFrame {
    remaining: usize,
    items: Vec<Value>,
}

/// A resumable RESP decoder. One instance decodes one connection's entire
/// incoming stream; `feed` may be called any number of times with
/// arbitrarily sized chunks.
pub struct Parser {
    state: State,
    current_type: Option<TypeMarker>,
    line: Vec<u8>,
    bulk_remaining: usize,
    bulk_buf: Vec<u8>,
    stack: Vec<ArrayFrame>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            state: State::TypeByte,
            current_type: None,
            line: Vec::new(),
            bulk_remaining: 0,
            bulk_buf: Vec::new(),
            stack: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.state == State::Failed
    }

    fn fail(&mut self, msg: &str) -> Error {
        self.state = State::Failed;
        Error::new(ErrorKind::ProtocolError, msg.to_string())
    }

    /// Feeds `data`, attempting to decode exactly one top-level value.
    /// Returns `Ok((consumed, Some(value)))` once one completes,
    /// `Ok((consumed, None))` if more bytes are needed, or `Err` on
    /// malformed input (after which the parser is terminally failed).
    pub fn feed(&mut self, data: &[u8]) -> Result<(usize, Option<Value>), Error> {
        if self.state == State::Failed {
            return Err(Error::new(ErrorKind::ProtocolError, "RESP parser already failed"));
        }
        let mut pos = 0;
        loop {
            match self.state {
                State::TypeByte => {
                    if pos >= data.len() {
                        return Ok((pos, None));
                    }
                    let b = data[pos];
                    pos += 1;
                    self.current_type = Some(match b {
                        b'+' => TypeMarker::Simple,
                        b'-' => TypeMarker::Error,
                        b':' => TypeMarker::Integer,
                        b'$' => TypeMarker::Bulk,
                        b'*' => TypeMarker::Array,
                        b'_' => TypeMarker::Null,
                        _ => return Err(self.fail("unrecognized RESP type byte")),
                    });
                    self.line.clear();
                    self.state = State::Line;
                }
                State::Line => {
                    let mut done = false;
                    while pos < data.len() {
                        let b = data[pos];
                        pos += 1;
                        if b == b'\r' {
                            self.state = State::LineLf;
                            done = true;
                            break;
                        }
                        self.line.push(b);
                    }
                    if !done {
                        return Ok((pos, None));
                    }
                }
                State::LineLf => {
                    if pos >= data.len() {
                        return Ok((pos, None));
                    }
                    let b = data[pos];
                    pos += 1;
                    if b != b'\n' {
                        return Err(self.fail("expected LF after CR terminating a RESP line"));
                    }
                    match self.finish_line()? {
                        Some(value) => return Ok((pos, Some(value))),
                        None => continue,
                    }
                }
                State::BulkBody => {
                    let need = self.bulk_remaining - self.bulk_buf.len();
                    let take = need.min(data.len() - pos);
                    self.bulk_buf.extend_from_slice(&data[pos..pos + take]);
                    pos += take;
                    if self.bulk_buf.len() < self.bulk_remaining {
                        return Ok((pos, None));
                    }
                    self.state = State::BulkCr;
                }
                State::BulkCr => {
                    if pos >= data.len() {
                        return Ok((pos, None));
                    }
                    let b = data[pos];
                    pos += 1;
                    if b != b'\r' {
                        return Err(self.fail("bulk string payload not followed by CRLF"));
                    }
                    self.state = State::BulkLf;
                }
                State::BulkLf => {
                    if pos >= data.len() {
                        return Ok((pos, None));
                    }
                    let b = data[pos];
                    pos += 1;
                    if b != b'\n' {
                        return Err(self.fail("bulk string payload not followed by CRLF"));
                    }
                    let bulk = std::mem::take(&mut self.bulk_buf);
                    match self.complete_value(Value::BulkString(Some(bulk))) {
                        Some(value) => return Ok((pos, Some(value))),
                        None => continue,
                    }
                }
                State::Failed => unreachable!("checked at function entry"),
            }
        }
    }

    fn finish_line(&mut self) -> Result<Option<Value>, Error> {
        let marker = self.current_type.take().expect("type byte always set before a line");
        let line = std::mem::take(&mut self.line);
        let text = std::str::from_utf8(&line)
            .map_err(|_| self.fail("RESP line is not valid UTF-8"))?
            .to_string();

        match marker {
            TypeMarker::Simple => Ok(self.complete_value(Value::SimpleString(text))),
            TypeMarker::Error => Ok(self.complete_value(Value::Error(text))),
            TypeMarker::Integer => {
                let n: i64 = text
                    .parse()
                    .map_err(|_| Error::new(ErrorKind::ProtocolError, "RESP integer is not a valid i64"))?;
                Ok(self.complete_value(Value::Integer(n)))
            }
            TypeMarker::Null => {
                if !text.is_empty() {
                    return Err(Error::new(ErrorKind::ProtocolError, "RESP3 null terminator carries a payload"));
                }
                Ok(self.complete_value(Value::Null))
            }
            TypeMarker::Bulk => {
                let len: i64 = text
                    .parse()
                    .map_err(|_| Error::new(ErrorKind::ProtocolError, "bulk string length is not a valid i64"))?;
                if len < 0 {
                    return Ok(self.complete_value(Value::BulkString(None)));
                }
                self.bulk_remaining = len as usize;
                self.bulk_buf = Vec::with_capacity(self.bulk_remaining);
                self.state = State::BulkBody;
                Ok(None)
            }
            TypeMarker::Array => {
                let count: i64 = text
                    .parse()
                    .map_err(|_| Error::new(ErrorKind::ProtocolError, "array count is not a valid i64"))?;
                if count < 0 {
                    return Ok(self.complete_value(Value::Array(None)));
                }
                if count == 0 {
                    return Ok(self.complete_value(Value::Array(Some(Vec::new()))));
                }
                self.stack.push(ArrayFrame {
                    remaining: count as usize,
                    items: Vec::with_capacity(count as usize),
                });
                self.state = State::TypeByte;
                Ok(None)
            }
        }
    }

    /// Pushes a just-decoded value onto the innermost open array, cascading
    /// closures of any arrays that complete as a result. Returns the
    /// top-level value once the stack empties, or `None` while nested
    /// arrays are still awaiting more elements.
    fn complete_value(&mut self, value: Value) -> Option<Value> {
        let mut value = value;
        loop {
            match self.stack.last_mut() {
                None => {
                    self.state = State::TypeByte;
                    return Some(value);
                }
                Some(frame) => {
                    frame.items.push(value);
                    if frame.items.len() < frame.remaining {
                        self.state = State::TypeByte;
                        return None;
                    }
                    let frame = self.stack.pop().expect("just matched Some above");
                    value = Value::Array(Some(frame.items));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::value::encode;

    #[test]
    fn parses_simple_string() {
        let mut parser = Parser::new();
        let (consumed, value) = parser.feed(b"+OK\r\n").unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(value.unwrap(), Value::SimpleString("OK".to_string()));
    }

    #[test]
    fn parses_null_bulk_string() {
        let mut parser = Parser::new();
        let (_, value) = parser.feed(b"$-1\r\n").unwrap();
        assert_eq!(value.unwrap(), Value::BulkString(None));
    }

    #[test]
    fn parses_bulk_string_split_mid_payload() {
        let mut parser = Parser::new();
        assert!(parser.feed(b"$5\r\nhel").unwrap().1.is_none());
        let (_, value) = parser.feed(b"lo\r\n").unwrap();
        assert_eq!(value.unwrap(), Value::BulkString(Some(b"hello".to_vec())));
    }

    #[test]
    fn crlf_split_exactly_between_cr_and_lf_still_completes() {
        let mut parser = Parser::new();
        assert!(parser.feed(b"+OK\r").unwrap().1.is_none());
        let (_, value) = parser.feed(b"\n").unwrap();
        assert_eq!(value.unwrap(), Value::SimpleString("OK".to_string()));
    }

    #[test]
    fn parses_nested_array() {
        let wire = b"*2\r\n$3\r\nfoo\r\n*1\r\n:7\r\n";
        let mut parser = Parser::new();
        let (consumed, value) = parser.feed(wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(
            value.unwrap(),
            Value::array(vec![Value::bulk(b"foo".to_vec()), Value::array(vec![Value::Integer(7)])])
        );
    }

    #[test]
    fn byte_at_a_time_feed_matches_whole_buffer_feed() {
        let wire = encode(&Value::command(&["PING"]));
        let mut parser = Parser::new();
        let mut result = None;
        for &b in &wire {
            let (_, value) = parser.feed(&[b]).unwrap();
            if value.is_some() {
                result = value;
            }
        }
        assert_eq!(result.unwrap(), Value::command(&["PING"]));
    }

    #[test]
    fn pipelined_values_are_yielded_one_call_cycle_at_a_time() {
        let mut parser = Parser::new();
        let wire = b"+PONG\r\n+OK\r\n$1\r\nv\r\n";
        let (c1, v1) = parser.feed(wire).unwrap();
        assert_eq!(v1.unwrap(), Value::SimpleString("PONG".to_string()));
        let (c2, v2) = parser.feed(&wire[c1..]).unwrap();
        assert_eq!(v2.unwrap(), Value::SimpleString("OK".to_string()));
        let (_, v3) = parser.feed(&wire[c1 + c2..]).unwrap();
        assert_eq!(v3.unwrap(), Value::BulkString(Some(b"v".to_vec())));
    }

    #[test]
    fn unrecognized_type_byte_enters_failed_state() {
        let mut parser = Parser::new();
        assert!(parser.feed(b"^nope\r\n").is_err());
        assert!(parser.is_error());
    }
}
