//! Universal `select`/`poll`-based fallback backend. O(n) in the number of
//! registered descriptors and capped at a small capacity, matching the
//! contract that this backend is never preferred over a native one — it
//! exists so the crate still runs somewhere even when no platform backend
//! (and no `io-uring` feature) applies.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use crate::event::Event as LoomioEvent;
use crate::{Error, ErrorKind, Events, Interest, Token};

use super::Backend;

/// `poll(2)`'s own descriptor-count ceiling is generous, but loomio caps the
/// fallback well below it: callers who need more than this should be using
/// a native backend, not this one.
const MAX_REGISTRATIONS: usize = 1024;

#[derive(Debug)]
struct Registration {
    fd: RawFd,
    token: Token,
    interest: Interest,
}

#[derive(Debug, Default)]
pub struct SelectBackend {
    registrations: Mutex<HashMap<RawFd, Registration>>,
}

impl SelectBackend {
    pub fn new() -> Result<Self, Error> {
        Ok(SelectBackend::default())
    }
}

impl Backend for SelectBackend {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> Result<(), Error> {
        let mut regs = self.registrations.lock().unwrap();
        if regs.len() >= MAX_REGISTRATIONS {
            return Err(Error::new(
                ErrorKind::ResourceExhausted,
                format!("select backend is limited to {MAX_REGISTRATIONS} registrations"),
            ));
        }
        if regs.contains_key(&fd) {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "fd is already registered",
            ));
        }
        regs.insert(fd, Registration { fd, token, interest });
        Ok(())
    }

    fn modify(&self, fd: RawFd, token: Token, interest: Interest) -> Result<(), Error> {
        let mut regs = self.registrations.lock().unwrap();
        match regs.get_mut(&fd) {
            Some(reg) => {
                reg.token = token;
                reg.interest = interest;
                Ok(())
            }
            None => Err(Error::new(ErrorKind::InvalidState, "fd is not registered")),
        }
    }

    fn unregister(&self, fd: RawFd) -> Result<(), Error> {
        self.registrations.lock().unwrap().remove(&fd);
        Ok(())
    }

    fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> Result<(), Error> {
        let regs = self.registrations.lock().unwrap();
        let mut fds: Vec<libc::pollfd> = regs
            .values()
            .map(|r| {
                let mut fd_events = 0;
                if r.interest.is_readable() {
                    fd_events |= libc::POLLIN;
                }
                if r.interest.is_writable() {
                    fd_events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd: r.fd,
                    events: fd_events as i16,
                    revents: 0,
                }
            })
            .collect();
        let tokens: Vec<Token> = regs.values().map(|r| r.token).collect();
        drop(regs);

        let timeout_ms = timeout.map(|d| d.as_millis() as libc::c_int).unwrap_or(-1);
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }

        events.clear();
        for (pfd, token) in fds.iter().zip(tokens) {
            if pfd.revents == 0 {
                continue;
            }
            let mut event = LoomioEvent::new(token);
            event
                .set_readable(pfd.revents & libc::POLLIN != 0)
                .set_writable(pfd.revents & libc::POLLOUT != 0)
                .set_error(pfd.revents & libc::POLLERR != 0)
                .set_read_closed(pfd.revents & libc::POLLHUP != 0)
                .set_write_closed(pfd.revents & libc::POLLHUP != 0);
            events.push(event);
        }
        Ok(())
    }

    fn new_waker(
        &self,
        token: Token,
    ) -> Result<Box<dyn Fn() -> Result<(), Error> + Send + Sync>, Error> {
        // A self-pipe: writing a byte makes the read end POLLIN-ready.
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if ret < 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        let [read_fd, write_fd] = fds;
        self.register(read_fd, token, Interest::READABLE)?;

        Ok(Box::new(move || {
            let buf = [1u8];
            let ret = unsafe {
                libc::write(write_fd, buf.as_ptr() as *const libc::c_void, 1)
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
        "select"
    }

    fn kind(&self) -> super::BackendKind {
        super::BackendKind::Select
    }
}
