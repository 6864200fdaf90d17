//! The cross-thread work queue that feeds completions from worker threads
//! (and pooled tasks, see [`crate::threadpool`]) back to the loop thread.
//!
//! Grounded on the contract in the concurrency model: "workers receive jobs
//! via a thread-safe queue... post completions back to the loop via
//! `queue_work`". `flume` is used for the channel itself rather than
//! `std::sync::mpsc`, since a loop may want to wait on both the queue and a
//! wake source at once, and `flume`'s `Receiver` exposes a non-blocking
//! `try_recv` and a cloneable `Sender` that `std::sync::mpsc::Sender` does
//! not.

use std::fmt;

/// A boxed closure run on the loop thread once drained from the queue.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// The sending half of the cross-thread work queue. Cloneable and safe to
/// hand to any number of worker threads.
#[derive(Clone)]
pub struct WorkSender {
    tx: flume::Sender<WorkItem>,
}

impl WorkSender {
    /// Enqueues `item` to run on the loop thread. Returns an error if the
    /// loop has been dropped and no longer has a receiver.
    pub fn send(&self, item: WorkItem) -> Result<(), crate::Error> {
        self.tx.send(item).map_err(|_| {
            crate::Error::new(crate::ErrorKind::InvalidState, "loop work queue is closed")
        })
    }
}

impl fmt::Debug for WorkSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkSender").finish_non_exhaustive()
    }
}

/// The receiving half, owned exclusively by the loop.
pub struct WorkQueue {
    rx: flume::Receiver<WorkItem>,
    tx: flume::Sender<WorkItem>,
}

impl WorkQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        WorkQueue { rx, tx }
    }

    pub fn sender(&self) -> WorkSender {
        WorkSender {
            tx: self.tx.clone(),
        }
    }

    /// Drains every currently-queued item without blocking. Called once per
    /// loop iteration after the backend poll returns.
    pub fn drain(&self) -> Vec<WorkItem> {
        self.rx.try_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn drains_submitted_work_in_order() {
        let queue = WorkQueue::new();
        let sender = queue.sender();
        let counter = Arc::new(AtomicUsize::new(0));

        for expected in 0..5 {
            let counter = counter.clone();
            sender
                .send(Box::new(move || {
                    assert_eq!(counter.fetch_add(1, Ordering::SeqCst), expected);
                }))
                .unwrap();
        }

        let items = queue.drain();
        assert_eq!(items.len(), 5);
        for item in items {
            item();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn empty_queue_drains_nothing() {
        let queue = WorkQueue::new();
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }
}
