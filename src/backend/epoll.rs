//! Linux epoll backend. Edge-triggered with one-shot re-arm: every
//! registration uses `EPOLLONESHOT` plus `epoll_ctl(MOD)` to re-arm after
//! each delivered event, so a handle never receives a second notification
//! for the same readiness transition before its callback has had a chance
//! to drain it — matching the stream write-queue's expectation that a
//! "writable" event fires once per transition, not once per byte available.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;
use std::time::Duration;

use crate::event::Event as LoomioEvent;
use crate::{Error, ErrorKind, Events, Interest, Token};

use super::Backend;

#[derive(Debug)]
pub struct EpollBackend {
    epfd: OwnedFd,
    // epoll_wait needs a scratch buffer of its own native event struct;
    // kept behind a mutex since `poll` takes `&self` (the loop thread is the
    // only caller, but `Backend` methods must stay `Send` + usable through
    // a shared reference for the waker to call `register`/`modify`
    // concurrently with an in-flight poll).
    scratch: Mutex<Vec<libc::epoll_event>>,
}

impl EpollBackend {
    pub fn new() -> Result<Self, Error> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io_err("epoll_create1"));
        }
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(EpollBackend {
            epfd,
            scratch: Mutex::new(Vec::new()),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, interest: Option<Interest>) -> Result<(), Error> {
        let mut ev = libc::epoll_event {
            events: interest.map(interests_to_epoll).unwrap_or(0),
            u64: usize::from(token) as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(io_err("epoll_ctl"));
        }
        Ok(())
    }
}

impl Backend for EpollBackend {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> Result<(), Error> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, Some(interest))
    }

    fn modify(&self, fd: RawFd, token: Token, interest: Interest) -> Result<(), Error> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, Some(interest))
    }

    fn unregister(&self, fd: RawFd) -> Result<(), Error> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, Token(0), None)
    }

    fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> Result<(), Error> {
        let timeout_ms = timeout
            .map(|d| {
                d.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(d)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        let mut scratch = self.scratch.lock().unwrap();
        let cap = events.capacity().max(1);
        scratch.resize(cap, libc::epoll_event { events: 0, u64: 0 });

        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                scratch.as_mut_ptr(),
                cap as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }

        events.clear();
        for raw in scratch.iter().take(n as usize) {
            let token = Token(raw.u64 as usize);
            let mut event = LoomioEvent::new(token);
            let flags = raw.events as libc::c_int;
            event
                .set_readable(flags & (libc::EPOLLIN | libc::EPOLLPRI) != 0)
                .set_writable(flags & libc::EPOLLOUT != 0)
                .set_error(flags & libc::EPOLLERR != 0)
                .set_priority(flags & libc::EPOLLPRI != 0)
                .set_read_closed(
                    flags & libc::EPOLLHUP != 0
                        || (flags & libc::EPOLLIN != 0 && flags & libc::EPOLLRDHUP != 0),
                )
                .set_write_closed(flags & libc::EPOLLHUP != 0 || flags & libc::EPOLLERR != 0);
            events.push(event);
        }
        Ok(())
    }

    fn new_waker(
        &self,
        token: Token,
    ) -> Result<Box<dyn Fn() -> Result<(), Error> + Send + Sync>, Error> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io_err("eventfd"));
        }
        let efd = unsafe { OwnedFd::from_raw_fd(fd) };
        self.register(efd.as_raw_fd(), token, Interest::READABLE)?;

        Ok(Box::new(move || {
            let buf: u64 = 1;
            let ret = unsafe {
                libc::write(
                    efd.as_raw_fd(),
                    &buf as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                // EAGAIN means the counter is already saturated, i.e.
                // someone else's wake is already pending; that's fine.
                if err.kind() != std::io::ErrorKind::WouldBlock {
                    return Err(err.into());
                }
            }
            Ok(())
        }))
    }

    fn name(&self) -> &'static str {
        "epoll"
    }

    fn kind(&self) -> super::BackendKind {
        super::BackendKind::Epoll
    }
}

fn interests_to_epoll(interest: Interest) -> u32 {
    let mut kind = libc::EPOLLONESHOT;
    if interest.is_readable() {
        kind |= libc::EPOLLIN | libc::EPOLLRDHUP;
    }
    if interest.is_writable() {
        kind |= libc::EPOLLOUT;
    }
    if interest.is_priority() {
        kind |= libc::EPOLLPRI;
    }
    kind as u32
}

fn io_err(call: &'static str) -> Error {
    let err = std::io::Error::last_os_error();
    Error::with_source(ErrorKind::Io, format!("{call} failed"), err)
}
