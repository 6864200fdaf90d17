//! A pipelined RESP client over one [`TcpStream`], per spec §4.8: an
//! ordered queue of in-flight requests, each dequeued and completed as its
//! response value finishes parsing. Layered over `stream::tcp` the same
//! way `http::server` layers the HTTP parser over it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;

use crate::loop_::SharedLoop;
use crate::stream::tcp::TcpStream;
use crate::{Error, ErrorKind};

use super::parser::Parser;
use super::value::{encode, Value};

struct PendingRequest {
    on_response: Box<dyn FnOnce(Value)>,
    on_error: Option<Box<dyn FnOnce(Error)>>,
}

/// A connected RESP client. Cheap to clone — every clone shares the same
/// underlying stream, parser, and in-flight request queue.
#[derive(Clone)]
pub struct RespClient {
    stream: Rc<TcpStream>,
    queue: Rc<RefCell<VecDeque<PendingRequest>>>,
}

impl RespClient {
    /// Connects to `addr` and returns a client immediately; `on_ready`
    /// fires once the connection actually completes (or fails), mirroring
    /// `TcpStream::connect`'s own synchronous-handle-plus-callback shape.
    /// `command` calls made before `on_ready` fires are queued the same as
    /// any other write — the stream buffers them until connected.
    pub fn connect(
        loop_: SharedLoop,
        addr: SocketAddr,
        on_ready: Box<dyn FnOnce(Result<RespClient, Error>)>,
    ) -> Result<RespClient, Error> {
        let client_cell: Rc<RefCell<Option<RespClient>>> = Rc::new(RefCell::new(None));
        let client_cell_for_cb = client_cell.clone();
        let stream = TcpStream::connect(
            loop_,
            addr,
            Box::new(move |result| match result {
                Ok(()) => {
                    let client = client_cell_for_cb
                        .borrow_mut()
                        .take()
                        .expect("client handle is filled in before connect() returns");
                    on_ready(Ok(client));
                }
                Err(e) => on_ready(Err(e)),
            }),
        )?;

        let client = RespClient::from_stream(stream, None);
        *client_cell.borrow_mut() = Some(client.clone());
        Ok(client)
    }

    /// Wraps an already-connected stream. `on_close`, if given, fires once
    /// (whether the close was graceful or an error) — the connection pool
    /// uses this to stop counting a dead connection against its `total`.
    pub(crate) fn from_stream(stream: TcpStream, on_close: Option<Box<dyn FnOnce()>>) -> Self {
        let stream = Rc::new(stream);
        let parser = Rc::new(RefCell::new(Parser::new()));
        let queue: Rc<RefCell<VecDeque<PendingRequest>>> = Rc::new(RefCell::new(VecDeque::new()));
        let on_close = Rc::new(RefCell::new(on_close));

        let read_stream = stream.clone();
        let read_queue = queue.clone();
        let _ = stream.read_start(
            Box::new(|suggested| vec![0u8; suggested.min(64 * 1024)]),
            Box::new(move |read_result, buf| {
                let n = match read_result {
                    Ok(0) | Err(_) => {
                        read_stream.close(None);
                        drain_on_close(&read_queue);
                        if let Some(cb) = on_close.borrow_mut().take() {
                            cb();
                        }
                        return;
                    }
                    Ok(n) => n,
                };

                let mut offset = 0;
                while offset < n {
                    let mut p = parser.borrow_mut();
                    let (consumed, value) = match p.feed(&buf[offset..n]) {
                        Ok(r) => r,
                        Err(_) => {
                            drop(p);
                            read_stream.close(None);
                            drain_on_close(&read_queue);
                            if let Some(cb) = on_close.borrow_mut().take() {
                                cb();
                            }
                            return;
                        }
                    };
                    drop(p);
                    offset += consumed;

                    let Some(value) = value else {
                        if consumed == 0 {
                            break;
                        }
                        continue;
                    };

                    let pending = read_queue.borrow_mut().pop_front();
                    if let Some(pending) = pending {
                        (pending.on_response)(value);
                    }
                }
            }),
        );

        RespClient { stream, queue }
    }

    /// Sends `value` (typically built via [`Value::command`]) and queues
    /// `on_response` to fire when the corresponding reply value finishes
    /// parsing. Pipelining is explicit: callers may issue many `command`
    /// calls before any reply arrives, and replies are matched to requests
    /// strictly in submission order.
    pub fn command(&self, value: &Value, on_response: Box<dyn FnOnce(Value)>, on_error: Option<Box<dyn FnOnce(Error)>>) {
        self.queue.borrow_mut().push_back(PendingRequest { on_response, on_error });
        let wire = encode(value);
        let _ = self.stream.write(Bytes::from(wire), Box::new(|_| {}));
    }

    pub fn close(&self) {
        self.stream.close(None);
    }
}

fn drain_on_close(queue: &Rc<RefCell<VecDeque<PendingRequest>>>) {
    let pending: Vec<_> = queue.borrow_mut().drain(..).collect();
    for p in pending {
        if let Some(on_error) = p.on_error {
            on_error(Error::new(ErrorKind::ConnectionClosed, "RESP connection closed with requests in flight"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::tcp::TcpListener;
    use crate::{Config, Loop, RunMode};
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn pipelined_commands_dispatch_responses_in_submission_order() {
        let loop_ = Loop::create(Config::default()).unwrap().into_shared();
        let listener = TcpListener::bind(loop_.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        // A bare echo-style server: whatever it receives, it replies with
        // three canned RESP values back to back, simulating PING/SET/GET.
        listener
            .listen(Box::new(move |result| {
                let server_stream = Rc::new(result.unwrap());
                let reply_stream = server_stream.clone();
                server_stream
                    .read_start(
                        Box::new(|s| vec![0u8; s.min(4096)]),
                        Box::new(move |res, _buf| {
                            if matches!(res, Ok(n) if n > 0) {
                                let _ = reply_stream.write(
                                    Bytes::from_static(b"+PONG\r\n+OK\r\n$1\r\nv\r\n"),
                                    Box::new(|_| {}),
                                );
                            }
                        }),
                    )
                    .unwrap();
            }))
            .unwrap();

        let results: Rc<StdRefCell<Vec<Value>>> = Rc::new(StdRefCell::new(Vec::new()));
        let client = RespClient::connect(loop_.clone(), addr, Box::new(|_| {})).unwrap();

        for _ in 0..200 {
            loop_.borrow_mut().run(RunMode::NoWait).unwrap();
            std::thread::yield_now();
        }

        for cmd in [vec!["PING"], vec!["SET", "k", "v"], vec!["GET", "k"]] {
            let results = results.clone();
            client.command(&Value::command(&cmd), Box::new(move |v| results.borrow_mut().push(v)), None);
        }

        for _ in 0..500 {
            loop_.borrow_mut().run(RunMode::NoWait).unwrap();
            if results.borrow().len() == 3 {
                break;
            }
            std::thread::yield_now();
        }

        let results = results.borrow();
        assert_eq!(results[0], Value::SimpleString("PONG".to_string()));
        assert_eq!(results[1], Value::SimpleString("OK".to_string()));
        assert_eq!(results[2], Value::BulkString(Some(b"v".to_vec())));
    }
}
