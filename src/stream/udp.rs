//! UDP datagram sockets: address-addressed sends and receives, per spec
//! §4.5. No ordering or delivery guarantees beyond the kernel's; a send
//! completes once the kernel accepts the packet, not once it reaches the
//! peer.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::rc::Rc;

#[cfg(unix)]
use std::os::fd::AsRawFd;
#[cfg(windows)]
use std::os::windows::io::AsRawSocket;

use log::trace;

use crate::backend::RawFd;
use crate::handle::{Handle, HandleKind};
use crate::interest::Interest;
use crate::loop_::{EventCallback, SharedLoop};
use crate::Error;

#[cfg(unix)]
fn raw_fd_of(socket: &StdUdpSocket) -> RawFd {
    socket.as_raw_fd()
}
#[cfg(windows)]
fn raw_fd_of(socket: &StdUdpSocket) -> RawFd {
    socket.as_raw_socket()
}

/// Called once per [`UdpSocket::send`], carrying success or the error the
/// kernel returned for this datagram.
pub type SendCallback = Box<dyn FnOnce(Result<(), Error>)>;
/// Called once per received datagram while `recv_start` is active, with the
/// buffer obtained from `alloc`, the number of bytes filled, and the
/// packet's source address.
pub type RecvCallback = Box<dyn FnMut(io::Result<usize>, Vec<u8>, Option<SocketAddr>)>;
pub type AllocCallback = Box<dyn FnMut(usize) -> Vec<u8>>;

pub struct UdpSocket {
    loop_: SharedLoop,
    handle: Handle,
    inner: Rc<StdUdpSocket>,
    recv_active: Rc<Cell<bool>>,
}

impl UdpSocket {
    pub fn bind(loop_: SharedLoop, addr: SocketAddr) -> Result<Self, Error> {
        let inner = StdUdpSocket::bind(addr)?;
        inner.set_nonblocking(true)?;
        let handle = loop_.borrow_mut().register_handle(HandleKind::Datagram);
        loop_.borrow_mut().activate_handle(handle);
        Ok(UdpSocket {
            loop_,
            handle,
            inner: Rc::new(inner),
            recv_active: Rc::new(Cell::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.inner.local_addr()?)
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Sends one datagram to `addr`. Completion fires once the kernel
    /// accepts the packet (or rejects it outright); there is no queueing or
    /// backpressure tracking for datagrams, unlike stream writes.
    pub fn send(&self, buf: &[u8], addr: SocketAddr, on_done: SendCallback) {
        let result = match self.inner.send_to(buf, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // The socket send buffer is full; spec treats a rejected
                // datagram as a completed send with an error rather than
                // queueing it for retry.
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        };
        on_done(result);
    }

    /// Starts delivering received datagrams. Each readiness notification is
    /// drained with repeated `recv_from` calls until `WouldBlock`.
    pub fn recv_start(&self, alloc: AllocCallback, recv_cb: RecvCallback) -> Result<(), Error> {
        self.recv_active.set(true);
        let inner = self.inner.clone();
        let recv_active = self.recv_active.clone();
        let alloc = RefCell::new(alloc);
        let recv_cb = RefCell::new(recv_cb);

        let cb: EventCallback = Box::new(move |event| {
            if !event.is_readable() || !recv_active.get() {
                return;
            }
            let mut alloc = alloc.borrow_mut();
            let mut recv_cb = recv_cb.borrow_mut();
            loop {
                let mut buf = alloc(64 * 1024);
                if buf.is_empty() {
                    return;
                }
                match inner.recv_from(&mut buf) {
                    Ok((n, source)) => {
                        buf.truncate(n);
                        recv_cb(Ok(n), buf, Some(source));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) => {
                        trace!("udp recv failed: {e}");
                        recv_cb(Err(e), Vec::new(), None);
                        return;
                    }
                }
            }
        });

        let fd = raw_fd_of(&self.inner);
        self.loop_
            .borrow_mut()
            .read_write_register(self.handle, fd, Interest::READABLE, cb)
    }

    pub fn recv_stop(&self) {
        self.recv_active.set(false);
    }

    pub fn close(&self, on_close: Option<Box<dyn FnOnce()>>) {
        let fd = raw_fd_of(&self.inner);
        let mut l = self.loop_.borrow_mut();
        let _ = l.unregister_io(fd);
        l.close_handle(self.handle, on_close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, Loop, RunMode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn send_and_receive_a_datagram() {
        let loop_ = Loop::create(Config::default())
            .expect("loop should construct")
            .into_shared();

        let server = UdpSocket::bind(loop_.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind(loop_.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let received2 = received.clone();
        server
            .recv_start(
                Box::new(|n| vec![0u8; n.min(4096)]),
                Box::new(move |res, buf, _from| {
                    if let Ok(n) = res {
                        received2.lock().unwrap().extend_from_slice(&buf[..n]);
                    }
                }),
            )
            .unwrap();

        let sent = Arc::new(AtomicUsize::new(0));
        let sent2 = sent.clone();
        client.send(
            b"ping",
            server_addr,
            Box::new(move |res| {
                if res.is_ok() {
                    sent2.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        assert_eq!(sent.load(Ordering::SeqCst), 1);

        for _ in 0..200 {
            loop_.borrow_mut().run(RunMode::NoWait).unwrap();
            if received.lock().unwrap().len() == 4 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(&*received.lock().unwrap(), b"ping");
    }
}
