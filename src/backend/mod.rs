//! The pluggable I/O backend: a uniform `register`/`modify`/`unregister`/
//! `poll` interface implemented by five concrete backends, selected at
//! [`crate::Loop`] construction time by user preference, then platform
//! default, then the portable fallback.

use std::fmt;
use std::time::Duration;

use crate::{Error, Events, Interest, Token};

/// The raw descriptor type a backend registers: a file descriptor on
/// Unix-likes, a socket handle on Windows. Kept as a crate-local alias so
/// the `Backend` trait signature compiles on every target without pulling
/// in `std::os::fd`, which is Unix-only.
#[cfg(unix)]
pub type RawFd = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawFd = std::os::windows::io::RawSocket;

mod select;
cfg_io_uring! {
    mod io_uring;
}

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_os = "macos",
    target_os = "ios"
))]
mod kqueue;
#[cfg(windows)]
mod iocp;

/// Identifies which concrete backend a [`Backend`] trait object is, for
/// introspection (`Loop::backend_kind`) and for honoring
/// `Config::backend_preference`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendKind {
    Epoll,
    Kqueue,
    IoUring,
    Iocp,
    Select,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Epoll => "epoll",
            BackendKind::Kqueue => "kqueue",
            BackendKind::IoUring => "io_uring",
            BackendKind::Iocp => "iocp",
            BackendKind::Select => "select",
        };
        f.write_str(s)
    }
}

/// The interface every concrete I/O backend implements. All methods are
/// non-blocking except [`Backend::poll`], which blocks up to `timeout`
/// (`None` meaning indefinitely).
pub trait Backend: fmt::Debug + Send {
    /// Begins watching `fd` for `interest`, reporting readiness under
    /// `token`. Registering the same `fd` twice without an intervening
    /// `unregister` is an error (`ErrorKind::InvalidState`).
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> Result<(), Error>;

    /// Changes the interest set for an already-registered `fd`.
    fn modify(&self, fd: RawFd, token: Token, interest: Interest) -> Result<(), Error>;

    /// Stops watching `fd`. No-op error if it was never registered.
    fn unregister(&self, fd: RawFd) -> Result<(), Error>;

    /// Blocks until at least one event is ready, `timeout` elapses, or the
    /// loop's waker fires, filling `events` with whatever is ready.
    fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> Result<(), Error>;

    /// Builds a [`crate::Waker`]-compatible wake function bound to this
    /// backend instance, registered under `token` (always
    /// [`Token::RESERVED`]).
    fn new_waker(
        &self,
        token: Token,
    ) -> Result<Box<dyn Fn() -> Result<(), Error> + Send + Sync>, Error>;

    /// A short, stable name for logs and `Loop::backend_name`.
    fn name(&self) -> &'static str;

    fn kind(&self) -> BackendKind;
}

/// Selects and constructs a backend: the caller's `preference` if given and
/// available on this platform, else the platform default, else the portable
/// `select`-based fallback. Never silently downgrades a preference that
/// *is* available to something else.
pub fn select_backend(preference: Option<BackendKind>) -> Result<Box<dyn Backend>, Error> {
    if let Some(kind) = preference {
        return construct(kind);
    }

    #[cfg(target_os = "linux")]
    {
        if cfg!(feature = "io-uring") {
            if let Ok(backend) = construct(BackendKind::IoUring) {
                return Ok(backend);
            }
        }
        return construct(BackendKind::Epoll);
    }

    #[cfg(any(
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly",
        target_os = "macos",
        target_os = "ios"
    ))]
    {
        return construct(BackendKind::Kqueue);
    }

    #[cfg(windows)]
    {
        return construct(BackendKind::Iocp);
    }

    #[allow(unreachable_code)]
    construct(BackendKind::Select)
}

fn construct(kind: BackendKind) -> Result<Box<dyn Backend>, Error> {
    match kind {
        #[cfg(target_os = "linux")]
        BackendKind::Epoll => Ok(Box::new(epoll::EpollBackend::new()?)),
        #[cfg(not(target_os = "linux"))]
        BackendKind::Epoll => Err(unsupported("epoll")),

        #[cfg(any(
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly",
            target_os = "macos",
            target_os = "ios"
        ))]
        BackendKind::Kqueue => Ok(Box::new(kqueue::KqueueBackend::new()?)),
        #[cfg(not(any(
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly",
            target_os = "macos",
            target_os = "ios"
        )))]
        BackendKind::Kqueue => Err(unsupported("kqueue")),

        #[cfg(all(target_os = "linux", feature = "io-uring"))]
        BackendKind::IoUring => Ok(Box::new(io_uring::IoUringBackend::new()?)),
        #[cfg(not(all(target_os = "linux", feature = "io-uring")))]
        BackendKind::IoUring => Err(unsupported("io_uring")),

        #[cfg(windows)]
        BackendKind::Iocp => Ok(Box::new(iocp::IocpBackend::new()?)),
        #[cfg(not(windows))]
        BackendKind::Iocp => Err(unsupported("iocp")),

        BackendKind::Select => Ok(Box::new(select::SelectBackend::new()?)),
    }
}

#[allow(dead_code)]
fn unsupported(name: &'static str) -> Error {
    Error::new(
        crate::ErrorKind::InvalidArgument,
        format!("backend `{name}` is not available on this platform/feature combination"),
    )
}
