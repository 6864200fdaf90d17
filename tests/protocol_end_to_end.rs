//! Concrete end-to-end scenarios per spec §8: a TCP echo round trip, an
//! HTTP GET, an HTTP chunked POST, a WebSocket handshake plus message
//! exchange, rate-limit middleware rejecting a burst, and RESP pipelining.
//!
//! Each test drives a real `Loop` with `RunMode::NoWait`, polling until its
//! condition is met or a bounded iteration count is exhausted — the same
//! pattern the library's own module-level tests use.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use loomio::stream::tcp::{TcpListener, TcpStream};
use loomio::{Config, Loop, RunMode, SharedLoop};

fn run_until<F: Fn() -> bool>(loop_: &SharedLoop, cond: F) {
    for _ in 0..2000 {
        loop_.borrow_mut().run(RunMode::NoWait).unwrap();
        if cond() {
            return;
        }
        std::thread::yield_now();
    }
    panic!("condition not met within the iteration budget");
}

#[test]
fn tcp_echo_round_trip() {
    let loop_ = Loop::create(Config::default()).unwrap().into_shared();
    let listener = TcpListener::bind(loop_.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    listener
        .listen(Box::new(|result| {
            let server_stream = Rc::new(result.unwrap());
            let echo_stream = server_stream.clone();
            server_stream
                .read_start(
                    Box::new(|s| vec![0u8; s.min(4096)]),
                    Box::new(move |res, buf| {
                        if let Ok(n) = res {
                            if n > 0 {
                                let _ = echo_stream.write(Bytes::copy_from_slice(&buf[..n]), Box::new(|_| {}));
                            }
                        }
                    }),
                )
                .unwrap();
        }))
        .unwrap();

    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let received_for_read = received.clone();
    let client = Rc::new(
        TcpStream::connect(loop_.clone(), addr, Box::new(|result| result.unwrap()))
            .unwrap(),
    );
    for _ in 0..200 {
        loop_.borrow_mut().run(RunMode::NoWait).unwrap();
        std::thread::yield_now();
    }

    client
        .read_start(
            Box::new(|s| vec![0u8; s.min(4096)]),
            Box::new(move |res, buf| {
                if let Ok(n) = res {
                    received_for_read.borrow_mut().extend_from_slice(&buf[..n]);
                }
            }),
        )
        .unwrap();
    client.write(Bytes::from_static(b"hello loomio"), Box::new(|_| {})).unwrap();

    run_until(&loop_, || received.borrow().as_slice() == b"hello loomio");
}

#[cfg(feature = "http")]
mod http_scenarios {
    use super::*;
    use loomio::http::{Context, Handler, HttpServer, Method, RateLimit, Router, ServerConfig, StatusCode};

    fn get_request(client: &Rc<TcpStream>, path: &str) {
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        client.write(Bytes::from(request.into_bytes()), Box::new(|_| {})).unwrap();
    }

    #[test]
    fn http_get_returns_the_routed_handlers_body() {
        let loop_ = Loop::create(Config::default()).unwrap().into_shared();
        let mut router: Router<Box<dyn Handler>> = Router::new();
        router.register(
            Method::Get,
            "/greet/:name",
            Box::new(|ctx: &mut Context, _chain: &mut loomio::http::Chain<'_>| {
                let name = ctx.data("param:name").unwrap_or("stranger").to_string();
                ctx.response.status = StatusCode(200);
                ctx.response.body = format!("hello, {name}").into_bytes();
            }),
        );

        let server = HttpServer::bind(loop_.clone(), "127.0.0.1:0".parse().unwrap(), router, Vec::new(), ServerConfig::default()).unwrap();
        let addr = server.local_addr().unwrap();
        server.listen().unwrap();

        let response: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let response_for_read = response.clone();
        let client = Rc::new(TcpStream::connect(loop_.clone(), addr, Box::new(|r| r.unwrap())).unwrap());
        for _ in 0..200 {
            loop_.borrow_mut().run(RunMode::NoWait).unwrap();
            std::thread::yield_now();
        }

        client
            .read_start(
                Box::new(|s| vec![0u8; s.min(4096)]),
                Box::new(move |res, buf| {
                    if let Ok(n) = res {
                        response_for_read.borrow_mut().extend_from_slice(&buf[..n]);
                    }
                }),
            )
            .unwrap();
        get_request(&client, "/greet/ferris");

        run_until(&loop_, || {
            String::from_utf8_lossy(&response.borrow()).contains("hello, ferris")
        });
        let text = String::from_utf8_lossy(&response.borrow()).into_owned();
        assert!(text.starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn http_chunked_post_body_is_reassembled() {
        let loop_ = Loop::create(Config::default()).unwrap().into_shared();
        let mut router: Router<Box<dyn Handler>> = Router::new();
        router.register(
            Method::Post,
            "/upload",
            Box::new(|ctx: &mut Context, _chain: &mut loomio::http::Chain<'_>| {
                ctx.response.status = StatusCode(200);
                ctx.response.body = ctx.request.body().to_vec();
            }),
        );

        let server = HttpServer::bind(loop_.clone(), "127.0.0.1:0".parse().unwrap(), router, Vec::new(), ServerConfig::default()).unwrap();
        let addr = server.local_addr().unwrap();
        server.listen().unwrap();

        let response: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let response_for_read = response.clone();
        let client = Rc::new(TcpStream::connect(loop_.clone(), addr, Box::new(|r| r.unwrap())).unwrap());
        for _ in 0..200 {
            loop_.borrow_mut().run(RunMode::NoWait).unwrap();
            std::thread::yield_now();
        }

        client
            .read_start(
                Box::new(|s| vec![0u8; s.min(4096)]),
                Box::new(move |res, buf| {
                    if let Ok(n) = res {
                        response_for_read.borrow_mut().extend_from_slice(&buf[..n]);
                    }
                }),
            )
            .unwrap();

        let request = concat!(
            "POST /upload HTTP/1.1\r\n",
            "Host: localhost\r\n",
            "Transfer-Encoding: chunked\r\n",
            "Connection: close\r\n",
            "\r\n",
            "5\r\nhello\r\n",
            "6\r\n world\r\n",
            "0\r\n\r\n",
        );
        client.write(Bytes::from_static(request.as_bytes()), Box::new(|_| {})).unwrap();

        run_until(&loop_, || {
            String::from_utf8_lossy(&response.borrow()).contains("hello world")
        });
    }

    #[test]
    fn rate_limit_middleware_rejects_a_burst() {
        let loop_ = Loop::create(Config::default()).unwrap().into_shared();
        let mut router: Router<Box<dyn Handler>> = Router::new();
        router.register(
            Method::Get,
            "/ping",
            Box::new(|ctx: &mut Context, _chain: &mut loomio::http::Chain<'_>| {
                ctx.response.status = StatusCode(200);
                ctx.response.body = b"pong".to_vec();
            }),
        );
        let globals: Vec<Box<dyn Handler>> = vec![Box::new(RateLimit::new(Duration::from_secs(60), 1))];

        let server = HttpServer::bind(loop_.clone(), "127.0.0.1:0".parse().unwrap(), router, globals, ServerConfig::default()).unwrap();
        let addr = server.local_addr().unwrap();
        server.listen().unwrap();

        let responses: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

        for _ in 0..2 {
            let response: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
            let response_for_read = response.clone();
            let client = Rc::new(TcpStream::connect(loop_.clone(), addr, Box::new(|r| r.unwrap())).unwrap());
            for _ in 0..200 {
                loop_.borrow_mut().run(RunMode::NoWait).unwrap();
                std::thread::yield_now();
            }
            client
                .read_start(
                    Box::new(|s| vec![0u8; s.min(4096)]),
                    Box::new(move |res, buf| {
                        if let Ok(n) = res {
                            response_for_read.borrow_mut().extend_from_slice(&buf[..n]);
                        }
                    }),
                )
                .unwrap();
            get_request(&client, "/ping");
            run_until(&loop_, || !response.borrow().is_empty());
            responses.borrow_mut().push(String::from_utf8_lossy(&response.borrow()).into_owned());
        }

        let responses = responses.borrow();
        assert!(responses[0].starts_with("HTTP/1.1 200"));
        assert!(responses[1].starts_with("HTTP/1.1 429"));
    }
}

#[cfg(feature = "websocket")]
mod websocket_scenario {
    use super::*;
    use loomio::http::{Method, Request, Version};
    use loomio::ws::{
        encode_frame, generate_client_key, validate_server_request, verify_server_accept, FrameParser, Message, Opcode,
        Role, WebSocketConnection,
    };

    #[test]
    fn server_validates_the_opening_handshake() {
        let key = generate_client_key();
        let request = Request::new(
            Method::Get,
            Version::Http11,
            "/chat".to_string(),
            vec![
                ("Upgrade".to_string(), "websocket".to_string()),
                ("Connection".to_string(), "Upgrade".to_string()),
                ("Sec-WebSocket-Version".to_string(), "13".to_string()),
                ("Sec-WebSocket-Key".to_string(), key.clone()),
            ],
            Vec::new(),
        );
        let accept = validate_server_request(&request).unwrap();
        assert!(verify_server_accept(&key, &accept));
    }

    #[test]
    fn connection_decodes_text_and_auto_replies_to_ping_after_handshake() {
        let loop_ = Loop::create(Config::default()).unwrap().into_shared();
        let listener = TcpListener::bind(loop_.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let messages: Rc<RefCell<Vec<Message>>> = Rc::new(RefCell::new(Vec::new()));
        let messages_for_accept = messages.clone();
        listener
            .listen(Box::new(move |result| {
                let stream = result.unwrap();
                let messages = messages_for_accept.clone();
                // The upgrade request/response is assumed already exchanged
                // (exercised standalone above); from here on the connection
                // is pure WebSocket framing.
                WebSocketConnection::start(
                    stream,
                    Role::Server,
                    Box::new(move |msg| messages.borrow_mut().push(msg)),
                )
                .unwrap();
            }))
            .unwrap();

        let client = Rc::new(TcpStream::connect(loop_.clone(), addr, Box::new(|r| r.unwrap())).unwrap());
        for _ in 0..200 {
            loop_.borrow_mut().run(RunMode::NoWait).unwrap();
            std::thread::yield_now();
        }

        let client_inbox: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let client_inbox_for_read = client_inbox.clone();
        client
            .read_start(
                Box::new(|s| vec![0u8; s.min(4096)]),
                Box::new(move |res, buf| {
                    if let Ok(n) = res {
                        client_inbox_for_read.borrow_mut().extend_from_slice(&buf[..n]);
                    }
                }),
            )
            .unwrap();

        let mut mask = [0u8; 4];
        {
            use rand::RngCore;
            rand::rng().fill_bytes(&mut mask);
        }
        let text_frame = encode_frame(true, Opcode::Text, b"hi server", Some(mask));
        client.write(Bytes::from(text_frame), Box::new(|_| {})).unwrap();

        run_until(&loop_, || !messages.borrow().is_empty());
        match &messages.borrow()[0] {
            Message::Text(text) => assert_eq!(text, "hi server"),
            other => panic!("expected a text message, got {other:?}"),
        }

        let ping_frame = encode_frame(true, Opcode::Ping, b"are you there", Some(mask));
        client.write(Bytes::from(ping_frame), Box::new(|_| {})).unwrap();

        run_until(&loop_, || {
            let mut parser = FrameParser::new(Role::Client);
            let inbox = client_inbox.borrow();
            matches!(parser.feed(&inbox), Ok((_, Some(frame))) if frame.opcode == Opcode::Pong)
        });
        let mut parser = FrameParser::new(Role::Client);
        let inbox = client_inbox.borrow();
        let (_, frame) = parser.feed(&inbox).unwrap();
        assert_eq!(frame.unwrap().payload, b"are you there");
    }
}

#[cfg(feature = "resp")]
mod resp_scenario {
    use super::*;
    use loomio::resp::{RespClient, Value};

    #[test]
    fn pipelined_requests_resolve_in_submission_order() {
        let loop_ = Loop::create(Config::default()).unwrap().into_shared();
        let listener = TcpListener::bind(loop_.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        listener
            .listen(Box::new(|result| {
                let server_stream = Rc::new(result.unwrap());
                let reply_stream = server_stream.clone();
                server_stream
                    .read_start(
                        Box::new(|s| vec![0u8; s.min(4096)]),
                        Box::new(move |res, _buf| {
                            if matches!(res, Ok(n) if n > 0) {
                                let _ = reply_stream.write(Bytes::from_static(b"+PONG\r\n:1\r\n"), Box::new(|_| {}));
                            }
                        }),
                    )
                    .unwrap();
            }))
            .unwrap();

        let results: Rc<RefCell<Vec<Value>>> = Rc::new(RefCell::new(Vec::new()));
        let client = RespClient::connect(loop_.clone(), addr, Box::new(|_| {})).unwrap();
        for _ in 0..200 {
            loop_.borrow_mut().run(RunMode::NoWait).unwrap();
            std::thread::yield_now();
        }

        for cmd in [vec!["PING"], vec!["INCR", "counter"]] {
            let results = results.clone();
            client.command(&Value::command(&cmd), Box::new(move |v| results.borrow_mut().push(v)), None);
        }

        run_until(&loop_, || results.borrow().len() == 2);
        assert_eq!(results.borrow()[0], Value::SimpleString("PONG".to_string()));
        assert_eq!(results.borrow()[1], Value::Integer(1));
    }
}
