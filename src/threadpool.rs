//! A fixed worker pool executing blocking jobs off the loop thread and
//! posting their completions back via [`crate::Loop::work_sender`].
//!
//! Grounded on the concurrency model's thread-pool contract ("workers
//! receive jobs via a thread-safe queue, execute blocking operations ...,
//! and post completions back to the loop via `queue_work`"), using the same
//! `flume` channel the cross-thread work queue itself is built on.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::queue::WorkSender;

/// A unit of blocking work submitted to a [`ThreadPool`]. Runs on a worker
/// thread, outside the loop; its return value is boxed as `Any` so
/// `JobHandle` can stay non-generic.
type Job = Box<dyn FnOnce() -> Box<dyn std::any::Any + Send> + Send>;

/// A fixed-size pool of worker threads. Jobs are submitted with
/// [`ThreadPool::submit`]; each job's completion callback is posted back to
/// a specific loop via that loop's [`WorkSender`], so the callback always
/// runs on the loop thread even though the job itself ran elsewhere.
pub struct ThreadPool {
    job_tx: Option<flume::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// A handle to a submitted job. Currently only used to join the pool on
/// shutdown; the job's result is delivered through the completion callback
/// passed to [`ThreadPool::submit`], not through this handle.
#[derive(Debug)]
pub struct JobHandle {
    _private: (),
}

impl ThreadPool {
    /// Spawns `size` worker threads, each pulling jobs off a shared queue.
    pub fn new(size: usize) -> Self {
        let (job_tx, job_rx) = flume::unbounded::<Job>();
        let job_rx = Arc::new(job_rx);
        let mut workers = Vec::with_capacity(size);
        for id in 0..size.max(1) {
            let job_rx = job_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("loomio-pool-{id}"))
                .spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        // Panics inside a job are confined to the worker
                        // thread; they never propagate to the loop thread,
                        // matching the "a handle-level error never aborts
                        // the loop" failure model for pooled work too.
                        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
                    }
                })
                .expect("failed to spawn thread pool worker");
            workers.push(handle);
        }
        ThreadPool {
            job_tx: Some(job_tx),
            workers,
        }
    }

    /// Runs `job` on a worker thread; once it returns, `on_done` is posted
    /// to `loop_sender` so it executes on the owning loop's thread with the
    /// job's result.
    pub fn submit<T, F, D>(&self, loop_sender: WorkSender, job: F, on_done: D) -> JobHandle
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        D: FnOnce(T) + Send + 'static,
    {
        let wrapped: Job = Box::new(move || Box::new(job()) as Box<dyn std::any::Any + Send>);
        let on_done = std::cell::Cell::new(Some(on_done));
        let loop_sender2 = loop_sender.clone();
        let relay: Job = Box::new(move || {
            let result = wrapped();
            let on_done = on_done
                .take()
                .expect("thread pool completion run more than once");
            let posted = loop_sender2.send(Box::new(move || {
                let value = *result
                    .downcast::<T>()
                    .expect("thread pool job result type mismatch");
                on_done(value);
            }));
            if posted.is_err() {
                log::warn!("thread pool job completed after its loop was dropped");
            }
            Box::new(()) as Box<dyn std::any::Any + Send>
        });
        if let Some(tx) = &self.job_tx {
            let _ = tx.send(relay);
        }
        let _ = loop_sender;
        JobHandle { _private: () }
    }

    /// Number of worker threads in this pool.
    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Drop the sender first so the channel disconnects; each worker's
        // `recv()` then returns `Err` and its loop exits, so the join below
        // always completes instead of blocking forever.
        self.job_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WorkQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn submitted_job_completion_runs_on_loop_queue() {
        let pool = ThreadPool::new(2);
        let queue = WorkQueue::new();
        let sender = queue.sender();
        let result = Arc::new(AtomicUsize::new(0));
        let result2 = result.clone();

        pool.submit(
            sender,
            || 21 + 21,
            move |value: i32| {
                result2.store(value as usize, Ordering::SeqCst);
            },
        );

        // Poll the loop's queue until the worker posts its completion.
        let mut drained = Vec::new();
        for _ in 0..1000 {
            let mut batch = queue.drain();
            if !batch.is_empty() {
                drained.append(&mut batch);
                break;
            }
            std::thread::yield_now();
        }
        for item in drained {
            item();
        }
        assert_eq!(result.load(Ordering::SeqCst), 42);
    }
}
