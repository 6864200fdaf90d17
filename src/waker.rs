//! A cross-thread primitive that wakes a blocked `poll` call.
//!
//! Every backend needs its own native wake mechanism (an `eventfd` under
//! epoll, a pipe under kqueue/select, a user event under IOCP, an SQE under
//! io_uring); `Waker` is the backend-agnostic handle callers actually hold.

use std::sync::Arc;

use crate::backend::Backend;
use crate::{Error, Token};

/// A handle that, when [`wake`](Waker::wake) is called from any thread,
/// causes the loop's next (or currently blocked) `poll` call to return.
///
/// Registered once per loop at construction time under the reserved
/// [`Token::RESERVED`]; the loop's dispatch code recognizes and swallows
/// wake notifications rather than forwarding them to caller callbacks.
/// `Clone`-able (the inner function is `Arc`-shared) so a [`crate::loop_::StopHandle`]
/// or a coroutine's resume callback can carry its own copy across threads.
#[derive(Debug, Clone)]
pub struct Waker {
    inner: Arc<dyn Fn() -> Result<(), Error> + Send + Sync>,
}

impl Waker {
    pub(crate) fn new(backend: &dyn Backend) -> Result<Self, Error> {
        let waker = backend.new_waker(Token::RESERVED)?;
        Ok(Waker { inner: Arc::from(waker) })
    }

    /// Wakes the loop. Safe to call from any thread, any number of times;
    /// multiple wakes before the loop drains them may coalesce into a
    /// single readiness notification, which is sufficient since the loop
    /// always drains the full work queue on waking, not just one item.
    pub fn wake(&self) -> Result<(), Error> {
        (self.inner)()
    }
}
