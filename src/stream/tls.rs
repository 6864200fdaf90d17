//! TLS streams: a `rustls` record layer wrapped around the same non-blocking
//! socket primitives `tcp` uses, dispatched through the same kind of single
//! readiness callback.
//!
//! Grounded on rask-old's `TlsConnection` (`connection.rs`): `read_tls` /
//! `process_new_packets` / the `IoState::plaintext_bytes_to_read` plaintext
//! pull, and an `event_set()` that derives backend interest from
//! `wants_read()`/`wants_write()` rather than a fixed mask.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::rc::Rc;
use std::sync::Arc;

use log::trace;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};

use crate::handle::{Handle, HandleKind};
use crate::interest::Interest;
use crate::loop_::{EventCallback, SharedLoop};
use crate::{Error, ErrorKind};

use super::tcp::{connect_nonblocking, raw_fd_of};
use super::{AllocCallback, ConnectCallback, ReadCallback, WriteDoneCallback};

/// Either side of a `rustls` connection. Both variants implement the same
/// `rustls::Connection` surface; this enum exists only so a `TlsStream` can
/// be built from either without a trait object per call site.
enum TlsSide {
    Server(Box<ServerConnection>),
    Client(Box<ClientConnection>),
}

impl TlsSide {
    fn read_tls(&mut self, reader: &mut impl Read) -> io::Result<usize> {
        match self {
            TlsSide::Server(c) => c.read_tls(reader),
            TlsSide::Client(c) => c.read_tls(reader),
        }
    }

    fn write_tls(&mut self, writer: &mut impl Write) -> io::Result<usize> {
        match self {
            TlsSide::Server(c) => c.write_tls(writer),
            TlsSide::Client(c) => c.write_tls(writer),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsSide::Server(c) => c.process_new_packets(),
            TlsSide::Client(c) => c.process_new_packets(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            TlsSide::Server(c) => c.wants_read(),
            TlsSide::Client(c) => c.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsSide::Server(c) => c.wants_write(),
            TlsSide::Client(c) => c.wants_write(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsSide::Server(c) => c.writer(),
            TlsSide::Client(c) => c.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsSide::Server(c) => c.reader(),
            TlsSide::Client(c) => c.reader(),
        }
    }

    /// Backend interest derived from the handshake/record state, mirroring
    /// `TlsConnection::event_set` rather than a fixed readable mask.
    fn event_set(&self) -> Interest {
        interest_from_wants(self.wants_read(), self.wants_write())
    }
}

fn interest_from_wants(wants_read: bool, wants_write: bool) -> Interest {
    if wants_write {
        if wants_read {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::WRITABLE
        }
    } else {
        Interest::READABLE
    }
}

/// A non-blocking TLS stream over a plain TCP socket.
pub struct TlsStream {
    loop_: SharedLoop,
    handle: Handle,
    socket: Rc<RefCell<StdTcpStream>>,
    tls: Rc<RefCell<TlsSide>>,
    read_paused: Rc<Cell<bool>>,
    pending_writes: Rc<RefCell<VecDeque<WriteDoneCallback>>>,
    connect_cb: Rc<RefCell<Option<ConnectCallback>>>,
    closed: Rc<Cell<bool>>,
}

impl TlsStream {
    /// Begins a non-blocking TCP connect to `addr`, then drives a TLS client
    /// handshake over it. `on_connect` fires exactly once, after the
    /// handshake completes (or the connect/handshake fails) — later than
    /// the plain `TcpStream::connect` contract, since a TLS caller's first
    /// meaningful readiness is "ready to exchange application data", not
    /// "TCP connected".
    pub fn connect(
        loop_: SharedLoop,
        addr: SocketAddr,
        server_name: ServerName<'static>,
        config: Arc<ClientConfig>,
        on_connect: ConnectCallback,
    ) -> Result<Self, Error> {
        let std_stream = connect_nonblocking(addr)?;
        let client = ClientConnection::new(config, server_name)
            .map_err(|e| Error::new(ErrorKind::InvalidState, e.to_string()))?;
        let handle = loop_.borrow_mut().register_handle(HandleKind::Stream);
        let stream = TlsStream {
            loop_: loop_.clone(),
            handle,
            socket: Rc::new(RefCell::new(std_stream)),
            tls: Rc::new(RefCell::new(TlsSide::Client(Box::new(client)))),
            read_paused: Rc::new(Cell::new(true)),
            pending_writes: Rc::new(RefCell::new(VecDeque::new())),
            connect_cb: Rc::new(RefCell::new(Some(on_connect))),
            closed: Rc::new(Cell::new(false)),
        };
        stream.install_dispatch()?;
        loop_.borrow_mut().activate_handle(handle);
        Ok(stream)
    }

    /// Wraps an already-accepted TCP socket and drives a TLS server
    /// handshake over it.
    pub fn accept(
        loop_: SharedLoop,
        std_stream: StdTcpStream,
        config: Arc<ServerConfig>,
        on_handshake: ConnectCallback,
    ) -> Result<Self, Error> {
        let server = ServerConnection::new(config)
            .map_err(|e| Error::new(ErrorKind::InvalidState, e.to_string()))?;
        let handle = loop_.borrow_mut().register_handle(HandleKind::Stream);
        let stream = TlsStream {
            loop_: loop_.clone(),
            handle,
            socket: Rc::new(RefCell::new(std_stream)),
            tls: Rc::new(RefCell::new(TlsSide::Server(Box::new(server)))),
            read_paused: Rc::new(Cell::new(true)),
            pending_writes: Rc::new(RefCell::new(VecDeque::new())),
            connect_cb: Rc::new(RefCell::new(Some(on_handshake))),
            closed: Rc::new(Cell::new(false)),
        };
        stream.install_dispatch()?;
        loop_.borrow_mut().activate_handle(handle);
        Ok(stream)
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    fn install_dispatch(&self) -> Result<(), Error> {
        self.rearm_readiness_callback(None, None)
    }

    /// (Re)installs the readiness callback. Called once at construction and
    /// again whenever `read_start`/`read_stop` changes whether plaintext
    /// reads should be delivered.
    fn rearm_readiness_callback(
        &self,
        alloc: Option<AllocCallback>,
        read_cb: Option<ReadCallback>,
    ) -> Result<(), Error> {
        let socket = self.socket.clone();
        let tls = self.tls.clone();
        let read_paused = self.read_paused.clone();
        let pending_writes = self.pending_writes.clone();
        let connect_cb = self.connect_cb.clone();
        let closed = self.closed.clone();
        let loop_for_cb = self.loop_.clone();
        let handle = self.handle;
        let alloc = RefCell::new(alloc);
        let read_cb = RefCell::new(read_cb);

        let cb: EventCallback = Box::new(move |event| {
            if closed.get() {
                return;
            }

            if event.is_writable() {
                if let Ok(n) = tls.borrow_mut().write_tls(&mut *socket.borrow_mut()) {
                    trace!("flushed {n} bytes of TLS record data");
                }
            }

            if event.is_readable() {
                match tls.borrow_mut().read_tls(&mut *socket.borrow_mut()) {
                    Ok(0) => {
                        closed.set(true);
                        return;
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(_) => {
                        closed.set(true);
                        return;
                    }
                }

                let io_state = match tls.borrow_mut().process_new_packets() {
                    Ok(state) => state,
                    Err(e) => {
                        trace!("tls record processing failed: {e}");
                        closed.set(true);
                        return;
                    }
                };

                if let Some(on_connect) = connect_cb.borrow_mut().take() {
                    if !tls.borrow().wants_write() || io_state.plaintext_bytes_to_read() > 0 {
                        on_connect(Ok(()));
                    } else {
                        *connect_cb.borrow_mut() = Some(on_connect);
                    }
                }

                let to_read = io_state.plaintext_bytes_to_read();
                if to_read > 0 && !read_paused.get() {
                    if let (Some(alloc), Some(read_cb)) =
                        (alloc.borrow_mut().as_mut(), read_cb.borrow_mut().as_mut())
                    {
                        let mut buf = alloc(to_read);
                        buf.resize(to_read.min(buf.capacity().max(to_read)), 0);
                        match tls.borrow_mut().reader().read(&mut buf) {
                            Ok(n) => {
                                buf.truncate(n);
                                read_cb(Ok(n), buf);
                            }
                            Err(e) => read_cb(Err(e), Vec::new()),
                        }
                    }
                }

                if io_state.peer_has_closed() {
                    closed.set(true);
                }
            }

            if !tls.borrow().wants_write() {
                for cb in pending_writes.borrow_mut().drain(..) {
                    cb(Ok(()));
                }
            }

            let fd = raw_fd_of(&socket.borrow());
            let interest = tls.borrow().event_set();
            let _ = loop_for_cb.borrow_mut().modify_interest(handle, fd, interest);
        });

        let fd = raw_fd_of(&self.socket.borrow());
        let interest = self.tls.borrow().event_set();
        self.loop_
            .borrow_mut()
            .read_write_register(self.handle, fd, interest, cb)
    }

    pub fn read_start(&self, alloc: AllocCallback, read_cb: ReadCallback) -> Result<(), Error> {
        self.read_paused.set(false);
        self.rearm_readiness_callback(Some(alloc), Some(read_cb))
    }

    pub fn read_stop(&self) {
        self.read_paused.set(true);
    }

    /// Buffers `data` into the TLS record writer and attempts an immediate
    /// flush. `on_done` fires once every currently-queued record has been
    /// flushed to the socket without blocking — rustls interleaves
    /// plaintext from separate `write` calls into one outgoing buffer, so
    /// per-call completion tracking (as `stream::WriteQueue` gives plain
    /// streams) isn't meaningful here.
    pub fn write(&self, data: &[u8], on_done: WriteDoneCallback) -> Result<(), Error> {
        self.tls
            .borrow_mut()
            .writer()
            .write_all(data)
            .map_err(|e| Error::new(ErrorKind::Io, e.to_string()))?;
        self.pending_writes.borrow_mut().push_back(on_done);

        let drained = self
            .tls
            .borrow_mut()
            .write_tls(&mut *self.socket.borrow_mut());
        if let Err(e) = drained {
            if e.kind() != io::ErrorKind::WouldBlock {
                for cb in self.pending_writes.borrow_mut().drain(..) {
                    cb(Err(Error::new(ErrorKind::Io, e.to_string())));
                }
                return Err(e.into());
            }
        }
        if !self.tls.borrow().wants_write() {
            for cb in self.pending_writes.borrow_mut().drain(..) {
                cb(Ok(()));
            }
        }

        let fd = raw_fd_of(&self.socket.borrow());
        let interest = self.tls.borrow().event_set();
        self.loop_.borrow_mut().modify_interest(self.handle, fd, interest)
    }

    pub fn close(&self, on_close: Option<Box<dyn FnOnce()>>) {
        self.closed.set(true);
        for cb in self.pending_writes.borrow_mut().drain(..) {
            cb(Err(Error::new(ErrorKind::Cancelled, "tls stream closed")));
        }
        let fd = raw_fd_of(&self.socket.borrow());
        let mut l = self.loop_.borrow_mut();
        let _ = l.unregister_io(fd);
        l.close_handle(self.handle, on_close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_only_when_nothing_to_read() {
        let interest = interest_from_wants(false, true);
        assert!(interest.is_writable());
        assert!(!interest.is_readable());
    }

    #[test]
    fn both_when_handshake_wants_read_and_write() {
        let interest = interest_from_wants(true, true);
        assert!(interest.is_readable());
        assert!(interest.is_writable());
    }

    #[test]
    fn read_only_once_handshake_settles() {
        let interest = interest_from_wants(true, false);
        assert!(interest.is_readable());
        assert!(!interest.is_writable());
    }
}
