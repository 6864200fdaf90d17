use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::Token;

/// An entry in the timer heap: a deadline paired with the token the loop
/// should report expiry against.
#[derive(Debug, Eq, PartialEq)]
struct Entry {
    deadline: Instant,
    seq: u64,
    token: Token,
}

// `BinaryHeap` is a max-heap; reverse the ordering so the earliest deadline
// sorts first. Ties break on insertion order (`seq`) so timers scheduled for
// the same instant fire in FIFO order, matching the documented invariant
// that timer expiry is deterministic given identical inputs.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of pending timer deadlines, used by the loop to compute the
/// next poll timeout and to expire due timers each iteration.
#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        TimerHeap {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn insert(&mut self, deadline: Instant, token: Token) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline,
            seq,
            token,
        });
    }

    pub fn insert_after(&mut self, delay: Duration, token: Token) -> Instant {
        let deadline = Instant::now() + delay;
        self.insert(deadline, token);
        deadline
    }

    /// Removes and returns every timer whose deadline is `<= now`, in
    /// deadline order.
    pub fn expire(&mut self, now: Instant) -> Vec<Token> {
        let mut expired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            expired.push(self.heap.pop().unwrap().token);
        }
        expired
    }

    /// How long until the next timer is due, or `None` if the heap is empty.
    /// Used to bound the backend's poll timeout.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(now))
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        heap.insert(base + Duration::from_millis(30), Token(3));
        heap.insert(base + Duration::from_millis(10), Token(1));
        heap.insert(base + Duration::from_millis(20), Token(2));

        let expired = heap.expire(base + Duration::from_millis(25));
        assert_eq!(expired, vec![Token(1), Token(2)]);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn ties_break_fifo() {
        let mut heap = TimerHeap::new();
        let deadline = Instant::now();
        heap.insert(deadline, Token(1));
        heap.insert(deadline, Token(2));
        let expired = heap.expire(deadline);
        assert_eq!(expired, vec![Token(1), Token(2)]);
    }

    #[test]
    fn next_timeout_reflects_earliest() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        assert_eq!(heap.next_timeout(now), None);
        heap.insert(now + Duration::from_millis(50), Token(1));
        let to = heap.next_timeout(now).unwrap();
        assert!(to <= Duration::from_millis(50));
    }
}
