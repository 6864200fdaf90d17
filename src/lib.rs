//! loomio is a single-process, cross-platform asynchronous I/O runtime core.
//!
//! The crate is organized around four tightly coupled subsystems:
//!
//! * an event loop ([`loop_`]) that owns handle lifecycle and timers,
//! * a pluggable I/O backend ([`backend`]) abstracting epoll, kqueue,
//!   io_uring, IOCP, and a portable select/poll fallback,
//! * stream transports and incremental protocol framers (`stream`, `http`,
//!   `ws`, `resp`, `mqtt`), and
//! * a stackful coroutine adaptor ([`coroutine`]) bound to the loop.
//!
//! Each optional surface is gated behind a Cargo feature; see the feature
//! table in `Cargo.toml` for the full list. `os-poll` and `net` are enabled
//! by default.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_debug_implementations)]

#[macro_use]
mod macros;

mod alloc;
mod error;
mod event;
mod interest;
mod queue;
mod timer;
mod token;

cfg_os_poll! {
    pub mod backend;
    mod handle;
    mod loop_;
    mod waker;

    pub use handle::{Handle, HandleKind, HandleState};
    pub use loop_::{Config, Loop, RunMode, SharedLoop, StopHandle};
    pub use waker::Waker;
}

cfg_net! {
    pub mod stream;
    mod threadpool;

    pub use threadpool::{JobHandle, ThreadPool};
}

cfg_http! {
    pub mod http;
}

cfg_websocket! {
    pub mod ws;
}

cfg_resp! {
    pub mod resp;
}

cfg_mqtt! {
    pub mod mqtt;
}

cfg_coroutine! {
    pub mod coroutine;
}

pub use error::{Error, ErrorKind};
pub use event::{Event, Events};
pub use interest::Interest;
pub use token::Token;

/// Re-exports of the small set of external-collaborator traits a caller may
/// need to implement (see [`alloc::Arena`]).
pub mod collaborators {
    pub use crate::alloc::Arena;
}
