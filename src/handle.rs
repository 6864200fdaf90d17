//! Handle lifecycle and the registry that owns every handle registered with
//! a [`crate::Loop`].
//!
//! Grounded on the re-architecture notes: the teacher's intrusive
//! doubly-linked lists keyed by raw pointers are replaced with a slab
//! (`slab::Slab`, the same crate the teacher already depends on)
//! keyed by [`Token`], the same shape rask-old's `Listener` uses for its
//! `Slab<Arc<Session>>` session table.

use std::fmt;

use slab::Slab;

use crate::Token;

/// What kind of I/O resource a handle represents. Used only for
/// introspection/debugging; dispatch is driven by readiness, not kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandleKind {
    Stream,
    Datagram,
    Timer,
    Poll,
    AsyncWake,
    Process,
    FsRequest,
}

/// A handle's position in its lifecycle. Transitions are one-directional:
/// `Init -> Active -> Closing -> Closed`. Close callbacks are always
/// delivered on a later loop iteration than the one that requested the
/// close, never synchronously within the call that initiated it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandleState {
    Init,
    Active,
    Closing,
    Closed,
}

struct Slot {
    kind: HandleKind,
    state: HandleState,
    close_cb: Option<Box<dyn FnOnce()>>,
}

/// A single registered handle's lifecycle, as seen by the loop. Callers
/// interact with concrete wrappers (`stream::TcpStream`, a timer id, ...);
/// `Handle` is the registry-facing identity shared by all of them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Handle {
    token: Token,
}

impl Handle {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Reconstructs a `Handle` from a raw token. Used internally by the loop
    /// when it already knows a token is a live registry key (timer expiry,
    /// event dispatch) and needs a `Handle` to call back into the registry.
    pub(crate) fn from_token(token: Token) -> Self {
        Handle { token }
    }
}

/// Owns every handle registered with a loop. Registration assigns a fresh
/// [`Token`]; the registry tracks each handle's [`HandleState`] so the loop
/// can run its close phase (deferred close-callback delivery) each
/// iteration without scanning unrelated handles.
#[derive(Default)]
pub struct Registry {
    slots: Slab<Slot>,
    closing: Vec<Token>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            slots: Slab::new(),
            closing: Vec::new(),
        }
    }

    pub fn insert(&mut self, kind: HandleKind) -> Handle {
        let key = self.slots.insert(Slot {
            kind,
            state: HandleState::Init,
            close_cb: None,
        });
        Handle { token: Token(key) }
    }

    pub fn activate(&mut self, handle: Handle) {
        if let Some(slot) = self.slots.get_mut(handle.token.0) {
            slot.state = HandleState::Active;
        }
    }

    pub fn kind(&self, handle: Handle) -> Option<HandleKind> {
        self.slots.get(handle.token.0).map(|s| s.kind)
    }

    pub fn state(&self, handle: Handle) -> Option<HandleState> {
        self.slots.get(handle.token.0).map(|s| s.state)
    }

    /// Marks a handle as closing and queues its close callback for the next
    /// iteration's close phase. Idempotent: closing an already-closing
    /// handle is a no-op.
    pub fn begin_close(&mut self, handle: Handle, close_cb: Option<Box<dyn FnOnce()>>) {
        if let Some(slot) = self.slots.get_mut(handle.token.0) {
            if slot.state == HandleState::Closing || slot.state == HandleState::Closed {
                return;
            }
            slot.state = HandleState::Closing;
            slot.close_cb = close_cb;
            self.closing.push(handle.token);
        }
    }

    /// Runs the close phase: removes every handle queued by [`begin_close`]
    /// from the registry and invokes its close callback, if any. Returns
    /// the number of handles closed, so the loop can decide whether to exit
    /// (no active handles left and no pending work).
    pub fn run_close_phase(&mut self) -> usize {
        let pending = std::mem::take(&mut self.closing);
        let count = pending.len();
        for token in pending {
            if let Some(mut slot) = self.slots.try_remove(token.0) {
                slot.state = HandleState::Closed;
                if let Some(cb) = slot.close_cb.take() {
                    cb();
                }
            }
        }
        count
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.state == HandleState::Active)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.slots.len())
            .field("pending_close", &self.closing.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_deferred_to_next_phase() {
        let mut reg = Registry::new();
        let handle = reg.insert(HandleKind::Stream);
        reg.activate(handle);
        assert_eq!(reg.state(handle), Some(HandleState::Active));

        reg.begin_close(handle, None);
        // Still present until the close phase runs.
        assert_eq!(reg.state(handle), Some(HandleState::Closing));

        let closed = reg.run_close_phase();
        assert_eq!(closed, 1);
        assert_eq!(reg.state(handle), None);
    }

    #[test]
    fn close_invokes_callback_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut reg = Registry::new();
        let handle = reg.insert(HandleKind::Timer);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        reg.begin_close(handle, Some(Box::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        })));
        reg.run_close_phase();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn double_close_is_idempotent() {
        let mut reg = Registry::new();
        let handle = reg.insert(HandleKind::Poll);
        reg.begin_close(handle, None);
        reg.begin_close(handle, None);
        assert_eq!(reg.run_close_phase(), 1);
    }
}
