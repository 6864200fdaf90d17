//! BSD kqueue backend (macOS, FreeBSD, OpenBSD, NetBSD, DragonFly).
//! Level-triggered, unlike the Linux epoll backend: a registered filter
//! keeps reporting readiness every poll until the underlying condition
//! changes, so no one-shot re-arm dance is needed here.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Mutex;
use std::time::Duration;

use crate::event::Event as LoomioEvent;
use crate::{Error, ErrorKind, Events, Interest, Token};

use super::Backend;

#[derive(Debug)]
pub struct KqueueBackend {
    kq: OwnedFd,
    scratch: Mutex<Vec<libc::kevent>>,
}

impl KqueueBackend {
    pub fn new() -> Result<Self, Error> {
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io_err("kqueue"));
        }
        let kq = unsafe { OwnedFd::from_raw_fd(fd) };
        // FD_CLOEXEC isn't set by `kqueue(2)` itself on all platforms.
        unsafe {
            let flags = libc::fcntl(kq.as_raw_fd(), libc::F_GETFD);
            if flags >= 0 {
                libc::fcntl(kq.as_raw_fd(), libc::F_SETFD, flags | libc::FD_CLOEXEC);
            }
        }
        Ok(KqueueBackend {
            kq,
            scratch: Mutex::new(Vec::new()),
        })
    }

    fn changelist(&self, fd: RawFd, interest: Interest, flags: u16) -> Vec<libc::kevent> {
        let mut changes = Vec::with_capacity(2);
        if interest.is_readable() {
            changes.push(kevent(fd, libc::EVFILT_READ, flags));
        }
        if interest.is_writable() {
            changes.push(kevent(fd, libc::EVFILT_WRITE, flags));
        }
        changes
    }

    fn apply(&self, mut changes: Vec<libc::kevent>) -> Result<(), Error> {
        if changes.is_empty() {
            return Ok(());
        }
        let ret = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_mut_ptr(),
                changes.len() as libc::c_int,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret < 0 {
            return Err(io_err("kevent"));
        }
        Ok(())
    }
}

fn kevent(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
    libc::kevent {
        ident: fd as libc::uintptr_t,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: ptr::null_mut(),
    }
}

impl Backend for KqueueBackend {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> Result<(), Error> {
        let mut changes = self.changelist(fd, interest, libc::EV_ADD | libc::EV_CLEAR);
        for c in &mut changes {
            c.udata = usize::from(token) as *mut libc::c_void;
        }
        self.apply(changes)
    }

    fn modify(&self, fd: RawFd, token: Token, interest: Interest) -> Result<(), Error> {
        // Clear both filters, then re-add only the ones now wanted; kqueue
        // has no single "replace interest" call.
        let mut remove = self.changelist(
            fd,
            Interest::READABLE | Interest::WRITABLE,
            libc::EV_DELETE,
        );
        // EV_DELETE on a filter that was never added returns ENOENT, which
        // is harmless here; ignore individual failures in the removal pass.
        for c in &mut remove {
            let _ = self.apply(vec![*c]);
        }
        self.register(fd, token, interest)
    }

    fn unregister(&self, fd: RawFd) -> Result<(), Error> {
        let changes = self.changelist(
            fd,
            Interest::READABLE | Interest::WRITABLE,
            libc::EV_DELETE,
        );
        for c in changes {
            let _ = self.apply(vec![c]);
        }
        Ok(())
    }

    fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> Result<(), Error> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });

        let mut scratch = self.scratch.lock().unwrap();
        let cap = events.capacity().max(1);
        scratch.resize(cap, kevent(0, 0, 0));

        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                scratch.as_mut_ptr(),
                cap as libc::c_int,
                ts.as_ref().map(|t| t as *const _).unwrap_or(ptr::null()),
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
            let token = Token(raw.udata as usize);
            let mut event = LoomioEvent::new(token);
            event
                .set_readable(raw.filter == libc::EVFILT_READ)
                .set_writable(raw.filter == libc::EVFILT_WRITE)
                .set_error(raw.flags & libc::EV_ERROR != 0)
                .set_read_closed(raw.flags & libc::EV_EOF != 0 && raw.filter == libc::EVFILT_READ)
                .set_write_closed(raw.flags & libc::EV_EOF != 0 && raw.filter == libc::EVFILT_WRITE);
            events.push(event);
        }
        Ok(())
    }

    fn new_waker(
        &self,
        token: Token,
    ) -> Result<Box<dyn Fn() -> Result<(), Error> + Send + Sync>, Error> {
        let kq_fd = self.kq.as_raw_fd();
        let mut add = kevent(0, libc::EVFILT_USER, libc::EV_ADD | libc::EV_CLEAR);
        add.udata = usize::from(token) as *mut libc::c_void;
        self.apply(vec![add])?;

        Ok(Box::new(move || {
            let mut trigger = kevent(0, libc::EVFILT_USER, 0);
            trigger.fflags = libc::NOTE_TRIGGER;
            let ret = unsafe {
                libc::kevent(kq_fd, &mut trigger, 1, ptr::null_mut(), 0, ptr::null())
            };
            if ret < 0 {
                return Err(io_err("kevent (wake)"));
            }
            Ok(())
        }))
    }

    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn kind(&self) -> super::BackendKind {
        super::BackendKind::Kqueue
    }
}

fn io_err(call: &'static str) -> Error {
    let err = std::io::Error::last_os_error();
    Error::with_source(ErrorKind::Io, format!("{call} failed"), err)
}
