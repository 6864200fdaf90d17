//! A connection pool for [`RespClient`]s, per spec §4.8: `acquire` is
//! asynchronous (synchronous hand-off of a free connection is still
//! delivered on a later drain, never inline within the call), `release`
//! hands a freed connection straight to a waiter if one is queued, and
//! connections that fail are never returned to the free list — the pool
//! just creates a replacement on the next `acquire` up to `max`.
//!
//! Grounded on the cyclic-ownership note in DESIGN.md: the pool owns its
//! connections outright, and a borrowed connection ([`PooledConnection`])
//! carries a return-to-pool guard that runs on `Drop`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::time::Duration;

use crate::loop_::SharedLoop;
use crate::Error;

use super::client::RespClient;

/// Tuning for one pool: which server to dial, and how many connections to
/// keep around.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub host: String,
    pub port: u16,
    pub initial_size: usize,
    pub max_size: usize,
}

struct PoolInner {
    loop_: SharedLoop,
    addr: SocketAddr,
    free: VecDeque<RespClient>,
    total: usize,
    max_size: usize,
    waiters: VecDeque<Box<dyn FnOnce(Result<PooledConnection, Error>)>>,
}

/// A `RespClient` on loan from a [`ConnectionPool`]. Dropping it (without
/// calling [`PooledConnection::discard`]) returns the connection to the
/// pool's free list, or hands it directly to a waiting `acquire` call.
pub struct PooledConnection {
    client: Option<RespClient>,
    inner: Rc<RefCell<PoolInner>>,
}

impl Deref for PooledConnection {
    type Target = RespClient;
    fn deref(&self) -> &RespClient {
        self.client.as_ref().expect("client taken only by discard/Drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut RespClient {
        self.client.as_mut().expect("client taken only by discard/Drop")
    }
}

impl PooledConnection {
    /// Removes this connection from circulation entirely — use when the
    /// caller has observed it fail and doesn't want it recycled. The pool
    /// still replaces it on demand up to `max`, since `total` is
    /// decremented here rather than on the next failed read.
    pub fn discard(mut self) {
        self.client.take();
        self.inner.borrow_mut().total -= 1;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            PoolInner::release(&self.inner, client);
        }
    }
}

/// A pool of [`RespClient`] connections to one `host:port`, bounded by
/// `max_size`.
pub struct ConnectionPool {
    inner: Rc<RefCell<PoolInner>>,
}

impl ConnectionPool {
    pub fn new(loop_: SharedLoop, config: PoolConfig) -> Result<Self, Error> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|_| Error::new(crate::ErrorKind::AddressInvalid, "invalid pool host/port"))?;
        let inner = Rc::new(RefCell::new(PoolInner {
            loop_,
            addr,
            free: VecDeque::new(),
            total: 0,
            max_size: config.max_size,
            waiters: VecDeque::new(),
        }));

        for _ in 0..config.initial_size {
            PoolInner::spawn_connection(&inner, Box::new(|_| {}));
        }

        Ok(ConnectionPool { inner })
    }

    /// Requests a connection. Delivery always happens asynchronously: a
    /// connection already on the free list is handed back on the next
    /// drain of the loop's immediate work (modeled here as a zero-delay
    /// timer, since a `RespClient` isn't `Send` and the loop's cross-thread
    /// queue requires it); otherwise a new connection is created (if under
    /// `max`) or the request is queued until one is released.
    pub fn acquire(&self, cb: Box<dyn FnOnce(Result<PooledConnection, Error>)>) {
        PoolInner::acquire(&self.inner, cb);
    }
}

impl PoolInner {
    /// Parks delivery of an already-free connection until the next loop
    /// iteration, so `acquire` never resolves synchronously within the
    /// call that requested it. A zero-delay one-shot timer plays the role
    /// `queue_work_immediate` plays for cross-thread work — it runs on the
    /// next drain — without `queue_work_immediate`'s `Send` bound, which a
    /// `RespClient`-closing callback can't satisfy.
    fn deliver_later(inner: &Rc<RefCell<PoolInner>>, cb: Box<dyn FnOnce(Result<PooledConnection, Error>)>, client: RespClient) {
        let pooled = PooledConnection {
            client: Some(client),
            inner: inner.clone(),
        };
        let loop_ = inner.borrow().loop_.clone();
        // `start_timer` callbacks are `FnMut`, but `cb`/`pooled` are only
        // `FnOnce`-movable; a `RefCell<Option<_>>` lets a `Box<dyn FnMut()>`
        // closure still only ever run its payload once (the timer itself
        // is one-shot, so it would only fire once regardless).
        let payload = RefCell::new(Some((cb, pooled)));
        loop_.borrow_mut().start_timer(
            Duration::ZERO,
            Duration::ZERO,
            Box::new(move || {
                if let Some((cb, pooled)) = payload.borrow_mut().take() {
                    cb(Ok(pooled));
                }
            }),
        );
    }

    fn acquire(inner: &Rc<RefCell<PoolInner>>, cb: Box<dyn FnOnce(Result<PooledConnection, Error>)>) {
        let free = inner.borrow_mut().free.pop_front();
        if let Some(client) = free {
            Self::deliver_later(inner, cb, client);
            return;
        }

        let under_max = {
            let guard = inner.borrow();
            guard.total < guard.max_size
        };
        if under_max {
            Self::spawn_connection(inner, cb);
        } else {
            inner.borrow_mut().waiters.push_back(cb);
        }
    }

    fn spawn_connection(inner: &Rc<RefCell<PoolInner>>, cb: Box<dyn FnOnce(Result<PooledConnection, Error>)>) {
        inner.borrow_mut().total += 1;
        let (loop_, addr) = {
            let guard = inner.borrow();
            (guard.loop_.clone(), guard.addr)
        };
        let inner_for_close = inner.clone();
        // `cb` must fire exactly once whether `connect` fails synchronously
        // (the `Err` branch below) or asynchronously (inside its own
        // callback); a shared cell lets either path claim it.
        let cb_cell: Rc<RefCell<Option<Box<dyn FnOnce(Result<PooledConnection, Error>)>>>> =
            Rc::new(RefCell::new(Some(cb)));
        let cb_cell_for_connect = cb_cell.clone();
        let connect_result = RespClient::connect(
            loop_,
            addr,
            Box::new(move |result| {
                let Some(cb) = cb_cell_for_connect.borrow_mut().take() else {
                    return;
                };
                match result {
                    Ok(client) => {
                        let pooled = PooledConnection {
                            client: Some(client),
                            inner: inner_for_close.clone(),
                        };
                        cb(Ok(pooled));
                    }
                    Err(e) => {
                        inner_for_close.borrow_mut().total -= 1;
                        cb(Err(e));
                    }
                }
            }),
        );
        if let Err(e) = connect_result {
            inner.borrow_mut().total -= 1;
            if let Some(cb) = cb_cell.borrow_mut().take() {
                cb(Err(e));
            }
        }
    }

    /// Hands `client` straight to a queued waiter if one exists, else puts
    /// it back on the free list.
    fn release(inner: &Rc<RefCell<PoolInner>>, client: RespClient) {
        let waiter = inner.borrow_mut().waiters.pop_front();
        match waiter {
            Some(cb) => {
                let pooled = PooledConnection {
                    client: Some(client),
                    inner: inner.clone(),
                };
                cb(Ok(pooled));
            }
            None => {
                inner.borrow_mut().free.push_back(client);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::tcp::TcpListener;
    use crate::{Config, Loop, RunMode};
    use std::cell::RefCell as StdRefCell;

    fn run_until<F: Fn() -> bool>(loop_: &SharedLoop, cond: F) {
        for _ in 0..1000 {
            loop_.borrow_mut().run(RunMode::NoWait).unwrap();
            if cond() {
                return;
            }
            std::thread::yield_now();
        }
    }

    #[test]
    fn acquire_creates_connections_up_to_max_then_queues() {
        let loop_ = Loop::create(Config::default()).unwrap().into_shared();
        let listener = TcpListener::bind(loop_.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        listener
            .listen(Box::new(|result| {
                // Accept and hold; the test only exercises acquire bookkeeping.
                std::mem::forget(result.unwrap());
            }))
            .unwrap();

        let pool = ConnectionPool::new(
            loop_.clone(),
            PoolConfig {
                host: addr.ip().to_string(),
                port: addr.port(),
                initial_size: 0,
                max_size: 1,
            },
        )
        .unwrap();

        let got_first: Rc<StdRefCell<Option<PooledConnection>>> = Rc::new(StdRefCell::new(None));
        let got_first2 = got_first.clone();
        pool.acquire(Box::new(move |res| {
            *got_first2.borrow_mut() = Some(res.unwrap());
        }));
        run_until(&loop_, || got_first.borrow().is_some());
        assert!(got_first.borrow().is_some());

        let second_pending = Rc::new(StdRefCell::new(false));
        let second_pending2 = second_pending.clone();
        pool.acquire(Box::new(move |_res| {
            *second_pending2.borrow_mut() = true;
        }));

        for _ in 0..20 {
            loop_.borrow_mut().run(RunMode::NoWait).unwrap();
        }
        assert!(!*second_pending.borrow(), "second acquire should queue while at max_size");

        // Releasing the first connection hands it straight to the waiter.
        got_first.borrow_mut().take();
        run_until(&loop_, || *second_pending.borrow());
        assert!(*second_pending.borrow());
    }
}
