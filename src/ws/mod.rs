//! WebSocket support per spec §4.7: the RFC 6455 frame state machine
//! ([`frame`]), the opening handshake ([`handshake`]), fragment assembly
//! and close-code validation ([`message`]), and [`WebSocketConnection`]
//! tying all three to a live [`crate::stream::tcp::TcpStream`] — the same
//! layering `crate::http::server::HttpServer` uses over the same
//! transport primitives, generalized from request/response framing to
//! frame/message framing.

pub mod frame;
pub mod handshake;
pub mod message;

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use rand::RngCore;

use crate::stream::tcp::TcpStream;
use crate::Error;

pub use frame::{encode_frame, Frame, FrameParser, Opcode, Role};
pub use handshake::{generate_client_key, validate_server_request, verify_server_accept};
pub use message::{CloseInfo, Message, MessageAssembler};

type MessageCallback = Box<dyn FnMut(Message)>;

fn random_mask() -> [u8; 4] {
    let mut key = [0u8; 4];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Outgoing frames from a `Client`-role connection must be masked; a
/// `Server`-role connection must send unmasked frames back to its client.
fn write_frame(stream: &TcpStream, role: Role, fin: bool, opcode: Opcode, payload: &[u8]) {
    let mask_key = match role {
        Role::Client => Some(random_mask()),
        Role::Server => None,
    };
    let wire = encode_frame(fin, opcode, payload, mask_key);
    let _ = stream.write(Bytes::from(wire), Box::new(|_| {}));
}

fn send_close(stream: &TcpStream, role: Role, code: u16, reason: &str) {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    write_frame(stream, role, true, Opcode::Close, &payload);
}

/// Drives one already-upgraded WebSocket connection: decodes incoming
/// bytes into whole messages, auto-replies to `Ping` with `Pong` carrying
/// the same payload, and answers a peer-initiated close with a close
/// frame (echoing its code if valid, 1002 otherwise) before closing the
/// transport. Completed messages — including `Close`, after which the
/// connection is already tearing down — are handed to `on_message`.
pub struct WebSocketConnection {
    stream: Rc<TcpStream>,
    role: Role,
}

impl WebSocketConnection {
    /// `role` names which side this instance receives frames *from*: a
    /// `Server` connection expects masked frames from its client, a
    /// `Client` connection expects unmasked frames from its server.
    pub fn start(stream: TcpStream, role: Role, mut on_message: MessageCallback) -> Result<Self, Error> {
        let stream = Rc::new(stream);
        let parser = Rc::new(RefCell::new(FrameParser::new(role)));
        let assembler = Rc::new(RefCell::new(MessageAssembler::new()));

        let read_stream = stream.clone();
        stream.read_start(
            Box::new(|suggested| vec![0u8; suggested.min(64 * 1024)]),
            Box::new(move |read_result, buf| {
                let n = match read_result {
                    Ok(0) | Err(_) => {
                        read_stream.close(None);
                        return;
                    }
                    Ok(n) => n,
                };

                let mut offset = 0;
                while offset < n {
                    let mut p = parser.borrow_mut();
                    let (consumed, frame) = match p.feed(&buf[offset..n]) {
                        Ok(r) => r,
                        Err(_) => {
                            drop(p);
                            read_stream.close(None);
                            return;
                        }
                    };
                    drop(p);
                    offset += consumed;

                    let Some(frame) = frame else {
                        if consumed == 0 {
                            break;
                        }
                        continue;
                    };

                    let ping_payload = (frame.opcode == Opcode::Ping).then(|| frame.payload.clone());

                    let mut a = assembler.borrow_mut();
                    let message = match a.accept(frame) {
                        Ok(m) => m,
                        Err(_) => {
                            drop(a);
                            send_close(&read_stream, role, 1002, "");
                            read_stream.close(None);
                            return;
                        }
                    };
                    drop(a);

                    if let Some(payload) = ping_payload {
                        write_frame(&read_stream, role, true, Opcode::Pong, &payload);
                    }

                    let Some(message) = message else {
                        continue;
                    };

                    let close_reply = match &message {
                        Message::Close(Some(info)) => Some((info.code, info.reason.clone())),
                        Message::Close(None) => Some((1000, String::new())),
                        _ => None,
                    };

                    on_message(message);

                    if let Some((code, reason)) = close_reply {
                        send_close(&read_stream, role, code, &reason);
                        read_stream.close(None);
                        return;
                    }
                }
            }),
        )?;

        Ok(WebSocketConnection { stream, role })
    }

    pub fn send_text(&self, text: &str) {
        write_frame(&self.stream, self.role, true, Opcode::Text, text.as_bytes());
    }

    pub fn send_binary(&self, data: &[u8]) {
        write_frame(&self.stream, self.role, true, Opcode::Binary, data);
    }

    pub fn send_ping(&self, data: &[u8]) {
        write_frame(&self.stream, self.role, true, Opcode::Ping, data);
    }

    /// Sends a close frame and shuts the transport down immediately —
    /// callers initiating a close don't wait for the peer's reply.
    pub fn close(&self, code: u16, reason: &str) {
        send_close(&self.stream, self.role, code, reason);
        self.stream.close(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, Loop, RunMode};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn server_connection_decodes_a_client_text_message() {
        let loop_ = Loop::create(Config::default()).unwrap().into_shared();
        let listener = crate::stream::tcp::TcpListener::bind(loop_.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let received: Rc<RefCell<Vec<Message>>> = Rc::new(RefCell::new(Vec::new()));
        let received_for_accept = received.clone();
        listener
            .listen(Box::new(move |result| {
                let stream = result.unwrap();
                let received = received_for_accept.clone();
                WebSocketConnection::start(
                    stream,
                    Role::Server,
                    Box::new(move |msg| received.borrow_mut().push(msg)),
                )
                .unwrap();
            }))
            .unwrap();

        let client = TcpStream::connect(loop_.clone(), addr, Box::new(move |_| {})).unwrap();
        for _ in 0..200 {
            loop_.borrow_mut().run(RunMode::NoWait).unwrap();
            std::thread::yield_now();
        }

        let frame = encode_frame(true, Opcode::Text, b"hi server", Some([1, 2, 3, 4]));
        client.write(Bytes::from(frame), Box::new(|_| {})).unwrap();

        for _ in 0..500 {
            loop_.borrow_mut().run(RunMode::NoWait).unwrap();
            if !received.borrow().is_empty() {
                break;
            }
            std::thread::yield_now();
        }

        match &received.borrow()[0] {
            Message::Text(s) => assert_eq!(s, "hi server"),
            other => panic!("expected a text message, got {other:?}"),
        }
    }

    #[test]
    fn server_connection_auto_replies_to_ping_with_pong() {
        let loop_ = Loop::create(Config::default()).unwrap().into_shared();
        let listener = crate::stream::tcp::TcpListener::bind(loop_.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        listener
            .listen(Box::new(move |result| {
                let stream = result.unwrap();
                WebSocketConnection::start(stream, Role::Server, Box::new(|_| {})).unwrap();
            }))
            .unwrap();

        let client = TcpStream::connect(loop_.clone(), addr, Box::new(move |_| {})).unwrap();
        for _ in 0..200 {
            loop_.borrow_mut().run(RunMode::NoWait).unwrap();
            std::thread::yield_now();
        }

        let client_inbox: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let client_inbox2 = client_inbox.clone();
        client
            .read_start(
                Box::new(|s| vec![0u8; s.min(4096)]),
                Box::new(move |res, buf| {
                    if let Ok(n) = res {
                        client_inbox2.borrow_mut().extend_from_slice(&buf[..n]);
                    }
                }),
            )
            .unwrap();

        let frame = encode_frame(true, Opcode::Ping, b"ping-payload", Some([9, 9, 9, 9]));
        client.write(Bytes::from(frame), Box::new(|_| {})).unwrap();

        for _ in 0..500 {
            loop_.borrow_mut().run(RunMode::NoWait).unwrap();
            if !client_inbox.borrow().is_empty() {
                break;
            }
            std::thread::yield_now();
        }

        let mut parser = FrameParser::new(Role::Client);
        let (_, reply) = parser.feed(&client_inbox.borrow()).unwrap();
        let reply = reply.unwrap();
        assert_eq!(reply.opcode, Opcode::Pong);
        assert_eq!(reply.payload, b"ping-payload");
    }
}
