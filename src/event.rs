use std::fmt;

use crate::Token;

/// A single readiness notification returned from a backend's `poll` call.
///
/// `Event` is backend-agnostic: every backend translates its native
/// notification (an `epoll_event`, a `kevent`, an IOCP completion, ...) into
/// this shape before handing it to the loop, so dispatch code never needs to
/// know which backend produced it.
#[derive(Clone, Copy)]
pub struct Event {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
    read_closed: bool,
    write_closed: bool,
    priority: bool,
}

impl Event {
    pub fn new(token: Token) -> Self {
        Event {
            token,
            readable: false,
            writable: false,
            error: false,
            read_closed: false,
            write_closed: false,
            priority: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    pub fn is_priority(&self) -> bool {
        self.priority
    }

    pub fn set_readable(&mut self, v: bool) -> &mut Self {
        self.readable = v;
        self
    }

    pub fn set_writable(&mut self, v: bool) -> &mut Self {
        self.writable = v;
        self
    }

    pub fn set_error(&mut self, v: bool) -> &mut Self {
        self.error = v;
        self
    }

    pub fn set_read_closed(&mut self, v: bool) -> &mut Self {
        self.read_closed = v;
        self
    }

    pub fn set_write_closed(&mut self, v: bool) -> &mut Self {
        self.write_closed = v;
        self
    }

    pub fn set_priority(&mut self, v: bool) -> &mut Self {
        self.priority = v;
        self
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("token", &self.token)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("error", &self.error)
            .field("read_closed", &self.read_closed)
            .field("write_closed", &self.write_closed)
            .field("priority", &self.priority)
            .finish()
    }
}

/// A fixed-capacity batch of [`Event`]s filled in by a single `poll` call.
///
/// Capacity is set once at construction (see `Config::max_events`) and
/// never grows during a poll: a full batch just means the next `poll` call
/// drains the rest, matching every backend's "you get what fits in the
/// buffer" contract.
#[derive(Debug)]
pub struct Events {
    inner: Vec<Event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub(crate) fn push(&mut self, event: Event) {
        self.inner.push(event);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.inner.iter()
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_flags_are_independent() {
        let mut e = Event::new(Token(1));
        e.set_readable(true).set_error(true);
        assert!(e.is_readable());
        assert!(e.is_error());
        assert!(!e.is_writable());
    }

    #[test]
    fn events_respects_capacity() {
        let mut events = Events::with_capacity(2);
        assert_eq!(events.capacity(), 2);
        events.push(Event::new(Token(0)));
        events.push(Event::new(Token(1)));
        assert_eq!(events.len(), 2);
    }
}
