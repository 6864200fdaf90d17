//! Fragment assembly, close-code validation, and the decoded-message
//! surface sitting on top of [`crate::ws::frame::FrameParser`], per spec
//! §4.7's invariants: continuation frames concatenate into one message
//! under the first fragment's opcode, text messages are UTF-8-checked at
//! completion, and close payloads are validated.

use crate::{Error, ErrorKind};

use super::frame::{Frame, Opcode};

/// A fully assembled incoming message — one or more frames concatenated,
/// already validated per its type's invariants.
#[derive(Clone, Debug)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseInfo>),
}

#[derive(Clone, Debug)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

fn is_valid_close_code(code: u16) -> bool {
    (1000..=4999).contains(&code) && !matches!(code, 1004 | 1005 | 1006 | 1015)
}

/// Parses a close frame's payload per spec: empty is valid (no code), or
/// the first two bytes big-endian are the code and the rest must be valid
/// UTF-8 of at most 123 bytes. Returns `Ok(None)` for an empty payload,
/// `Ok(Some(close))` for a well-formed one, `Err` for a malformed payload —
/// callers are expected to respond with code 1002 on `Err`.
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseInfo>, Error> {
    if payload.is_empty() {
        return Ok(None);
    }
    if payload.len() < 2 {
        return Err(Error::new(ErrorKind::ProtocolError, "close payload shorter than a code"));
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason_bytes = &payload[2..];
    if reason_bytes.len() > 123 {
        return Err(Error::new(ErrorKind::ProtocolError, "close reason exceeds 123 bytes"));
    }
    let reason = std::str::from_utf8(reason_bytes)
        .map_err(|_| Error::new(ErrorKind::ProtocolError, "close reason is not valid UTF-8"))?
        .to_string();
    if !is_valid_close_code(code) {
        return Err(Error::new(ErrorKind::ProtocolError, "invalid close code"));
    }
    Ok(Some(CloseInfo { code, reason }))
}

/// Assembles a sequence of frames into whole messages, buffering
/// continuation fragments until the terminal `FIN=1` frame arrives.
/// Control frames (ping/pong/close) always complete immediately — per the
/// protocol they cannot be fragmented, enforced upstream in the frame
/// parser.
#[derive(Default)]
pub struct MessageAssembler {
    fragment_opcode: Option<Opcode>,
    buffer: Vec<u8>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one decoded frame. Returns `Ok(Some(message))` once a message
    /// completes (immediately for control frames, on the final fragment
    /// for data frames), `Ok(None)` if more fragments are expected, or
    /// `Err` on a protocol violation (unexpected continuation, UTF-8
    /// failure, malformed close payload).
    pub fn accept(&mut self, frame: Frame) -> Result<Option<Message>, Error> {
        match frame.opcode {
            Opcode::Ping => return Ok(Some(Message::Ping(frame.payload))),
            Opcode::Pong => return Ok(Some(Message::Pong(frame.payload))),
            Opcode::Close => {
                let info = parse_close_payload(&frame.payload)?;
                return Ok(Some(Message::Close(info)));
            }
            Opcode::Continuation => {
                let Some(started) = self.fragment_opcode else {
                    return Err(Error::new(
                        ErrorKind::ProtocolError,
                        "continuation frame with no preceding fragment",
                    ));
                };
                self.buffer.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }
                let opcode = started;
                self.fragment_opcode = None;
                let payload = std::mem::take(&mut self.buffer);
                return Ok(Some(self.finish(opcode, payload)?));
            }
            Opcode::Text | Opcode::Binary => {
                if self.fragment_opcode.is_some() {
                    return Err(Error::new(
                        ErrorKind::ProtocolError,
                        "new data frame started before prior fragment sequence completed",
                    ));
                }
                if !frame.fin {
                    self.fragment_opcode = Some(frame.opcode);
                    self.buffer.clear();
                    self.buffer.extend_from_slice(&frame.payload);
                    return Ok(None);
                }
                return Ok(Some(self.finish(frame.opcode, frame.payload)?));
            }
        }
    }

    fn finish(&self, opcode: Opcode, payload: Vec<u8>) -> Result<Message, Error> {
        match opcode {
            Opcode::Text => {
                let text = String::from_utf8(payload)
                    .map_err(|_| Error::new(ErrorKind::ProtocolError, "text message is not valid UTF-8"))?;
                Ok(Message::Text(text))
            }
            Opcode::Binary => Ok(Message::Binary(payload)),
            _ => unreachable!("finish is only called for data opcodes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fin: bool, opcode: Opcode, payload: &[u8]) -> Frame {
        Frame {
            fin,
            opcode,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn single_frame_text_message_completes_immediately() {
        let mut asm = MessageAssembler::new();
        let msg = asm.accept(frame(true, Opcode::Text, b"hi")).unwrap().unwrap();
        matches!(msg, Message::Text(ref s) if s == "hi");
    }

    #[test]
    fn fragmented_binary_message_assembles_across_continuations() {
        let mut asm = MessageAssembler::new();
        assert!(asm.accept(frame(false, Opcode::Binary, b"AB")).unwrap().is_none());
        assert!(asm
            .accept(frame(false, Opcode::Continuation, b"CD"))
            .unwrap()
            .is_none());
        let msg = asm.accept(frame(true, Opcode::Continuation, b"EF")).unwrap().unwrap();
        match msg {
            Message::Binary(b) => assert_eq!(b, b"ABCDEF"),
            _ => panic!("expected binary message"),
        }
    }

    #[test]
    fn invalid_utf8_text_message_is_rejected_at_completion() {
        let mut asm = MessageAssembler::new();
        let bad = vec![0xff, 0xfe];
        assert!(asm.accept(frame(true, Opcode::Text, &bad)).is_err());
    }

    #[test]
    fn continuation_without_a_prior_fragment_is_an_error() {
        let mut asm = MessageAssembler::new();
        assert!(asm.accept(frame(true, Opcode::Continuation, b"x")).is_err());
    }

    #[test]
    fn close_payload_empty_is_valid_with_no_code() {
        assert!(parse_close_payload(&[]).unwrap().is_none());
    }

    #[test]
    fn close_payload_with_valid_code_and_reason() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let info = parse_close_payload(&payload).unwrap().unwrap();
        assert_eq!(info.code, 1000);
        assert_eq!(info.reason, "bye");
    }

    #[test]
    fn close_payload_with_reserved_code_is_rejected() {
        let payload = 1005u16.to_be_bytes().to_vec();
        assert!(parse_close_payload(&payload).is_err());
    }

    #[test]
    fn close_payload_shorter_than_a_code_is_rejected() {
        assert!(parse_close_payload(&[0x03]).is_err());
    }
}
