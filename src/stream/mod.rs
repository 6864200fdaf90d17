//! Stream transports: the full-duplex byte-stream contract shared by TCP,
//! Unix-domain (via the same `tcp` module's socket abstraction is not
//! applicable here — see `tcp`), and TLS streams, plus the datagram
//! endpoint and the ordered write queue every stream-like handle shares.
//!
//! Grounded on spec §4.4's write-queue algorithm and rask-old's
//! `rustls`-over-`mio` layering for how a record-layer stream reuses a
//! plain stream's non-blocking read/write primitives.

use std::collections::VecDeque;
use std::io::{self, ErrorKind as IoErrorKind, Read, Write};

use bytes::Bytes;

use crate::{Error, ErrorKind};

pub mod datagram;
pub mod tcp;
#[cfg(feature = "tls")]
pub mod tls;
pub mod udp;

pub use datagram::UdpEndpoint;
pub use tcp::{TcpListener, TcpStream};
#[cfg(feature = "tls")]
pub use tls::TlsStream;
pub use udp::UdpSocket;

/// Called once per `read_start` readiness event to obtain a destination
/// buffer. Mirrors spec §4.4's `alloc_cb`: the runtime never decides buffer
/// sizing on the caller's behalf.
pub type AllocCallback = Box<dyn FnMut(usize) -> Vec<u8>>;
/// `bytes_read` follows the spec's tri-state contract: `Ok(0)` means the
/// peer closed the write side, `Ok(n>0)` is `n` bytes of data, `Err` is a
/// read failure.
pub type ReadCallback = Box<dyn FnMut(io::Result<usize>, Vec<u8>)>;
/// Fires exactly once per [`write`](TcpStream::write) call, carrying success
/// or the error that aborted the whole pending queue.
pub type WriteDoneCallback = Box<dyn FnOnce(Result<(), Error>)>;
pub type ConnectCallback = Box<dyn FnOnce(Result<(), Error>)>;
pub type AcceptCallback = Box<dyn FnMut(Result<TcpStream, Error>)>;

struct PendingWrite {
    data: Bytes,
    offset: usize,
    on_done: WriteDoneCallback,
}

/// The ordered, per-handle write queue described in spec §4.4: each write
/// appends a slice; on writable readiness slices drain front-to-back; a
/// partial send leaves the remainder at the head of the queue; an error
/// aborts every pending slice's callback, in submission order.
pub(crate) struct WriteQueue {
    slices: VecDeque<PendingWrite>,
    queued_bytes: usize,
    high_water_mark: usize,
}

impl WriteQueue {
    pub(crate) fn new(high_water_mark: usize) -> Self {
        WriteQueue {
            slices: VecDeque::new(),
            queued_bytes: 0,
            high_water_mark,
        }
    }

    /// Appends a slice to the queue. Returns `true` if the queue is now
    /// over its high-water mark (backpressure should be observed by the
    /// caller going forward — existing writes are still accepted).
    pub(crate) fn push(&mut self, data: Bytes, on_done: WriteDoneCallback) -> bool {
        self.queued_bytes += data.len();
        self.slices.push_back(PendingWrite {
            data,
            offset: 0,
            on_done,
        });
        self.is_over_high_water()
    }

    pub(crate) fn is_over_high_water(&self) -> bool {
        self.queued_bytes > self.high_water_mark
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Attempts to drain as much of the queue as `writer` accepts without
    /// blocking. Stops at the first `WouldBlock`, a short write leaving its
    /// slice at the head of the queue with `offset` advanced. On a hard
    /// error, aborts every remaining slice's callback with the error, in
    /// FIFO order, and returns the error.
    pub(crate) fn drain<W: Write>(&mut self, writer: &mut W) -> Result<(), Error> {
        loop {
            let Some(front) = self.slices.front_mut() else {
                return Ok(());
            };
            match writer.write(&front.data[front.offset..]) {
                Ok(0) => {
                    // Kernel accepted zero bytes without erroring; treat as
                    // backpressure rather than spin.
                    return Ok(());
                }
                Ok(n) => {
                    front.offset += n;
                    self.queued_bytes -= n;
                    if front.offset >= front.data.len() {
                        let done = self.slices.pop_front().unwrap();
                        (done.on_done)(Ok(()));
                    }
                }
                Err(e) if e.kind() == IoErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    let err: Error = e.into();
                    self.fail_all(err.kind());
                    return Err(err);
                }
            }
        }
    }

    /// Fails every pending write with `kind`, in FIFO submission order.
    /// Used both on a hard I/O error and when the owning stream closes with
    /// writes still in flight (spec §4.3: "pending write completion
    /// callbacks for this handle are invoked with a cancellation error").
    pub(crate) fn fail_all(&mut self, kind: ErrorKind) {
        for pending in self.slices.drain(..) {
            self.queued_bytes -= pending.data.len() - pending.offset;
            (pending.on_done)(Err(Error::new(kind, "write aborted")));
        }
    }
}

/// Reads whatever is currently available from `reader` into buffers
/// obtained from `alloc`, invoking `read_cb` once per successful
/// non-blocking read and stopping at the first `WouldBlock`, error, or EOF.
/// Shared by TCP and TLS streams, which differ only in what `reader` is.
pub(crate) fn pump_reads<R: Read>(reader: &mut R, alloc: &mut AllocCallback, read_cb: &mut ReadCallback) {
    loop {
        let mut buf = alloc(64 * 1024);
        if buf.is_empty() {
            return;
        }
        match reader.read(&mut buf) {
            Ok(0) => {
                read_cb(Ok(0), buf);
                return;
            }
            Ok(n) => {
                buf.truncate(n);
                read_cb(Ok(n), buf);
            }
            Err(e) if e.kind() == IoErrorKind::WouldBlock => return,
            Err(e) => {
                read_cb(Err(e), Vec::new());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        accept: usize,
    }

    impl Write for CountingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len().min(self.accept))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fifo_completion_order() {
        let mut queue = WriteQueue::new(1024);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            queue.push(
                Bytes::from(vec![b'x'; 4]),
                Box::new(move |_| order.lock().unwrap().push(i)),
            );
        }
        let mut sink = CountingSink { accept: usize::MAX };
        queue.drain(&mut sink).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn partial_write_leaves_slice_at_head() {
        let mut queue = WriteQueue::new(1024);
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();
        queue.push(
            Bytes::from(vec![b'x'; 10]),
            Box::new(move |_| {
                done2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let mut sink = CountingSink { accept: 4 };
        queue.drain(&mut sink).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(queue.queued_bytes(), 6);

        let mut sink = CountingSink { accept: usize::MAX };
        queue.drain(&mut sink).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn high_water_mark_is_observable() {
        let mut queue = WriteQueue::new(8);
        let over = queue.push(Bytes::from(vec![0u8; 16]), Box::new(|_| {}));
        assert!(over);
        assert!(queue.is_over_high_water());
    }
}
