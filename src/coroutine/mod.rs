//! Stackful coroutine adaptor bound to a [`SharedLoop`], per spec §4.9.
//!
//! A coroutine is a [`generator`] generator whose stack, once started,
//! survives across suspension: `await_op` hands a resume callback to
//! whatever registers the async operation, then yields control back to the
//! loop. When the callback fires it stashes the result and schedules a step
//! (a zero-delay one-shot timer stands in for `queue_work_immediate`'s
//! cross-thread "schedule a step" role, the same substitution `resp::pool`
//! uses, since a coroutine's resume closures close over `Rc`/`RefCell` state
//! and can't satisfy `queue_work_immediate`'s `Send` bound); the step resumes
//! the generator, which continues running from the point it yielded.
//!
//! Grounded in mioco's architecture (a coroutine handle bound to one loop,
//! `await`-style suspension turning callback completions into linear code)
//! and the `generator` crate's own scoped-generator idiom for the
//! context-switching primitive itself.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use generator::{Gn, Generator, Scope};

use crate::loop_::SharedLoop;
use crate::{Error, ErrorKind};

/// Default stack size for a coroutine that doesn't request one explicitly:
/// 128 KiB, generous enough for a handful of nested `await_op` frames
/// without being wasteful when many coroutines run concurrently.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

type CoroutineGenerator = Generator<'static, (), ()>;

/// A running (or finished) coroutine. Cheap to hold onto after it finishes —
/// [`Coroutine::is_finished`] reports completion without panicking.
pub struct Coroutine {
    generator: RefCell<Option<CoroutineGenerator>>,
    resume_slot: RefCell<Option<Box<dyn Any>>>,
    loop_: SharedLoop,
    finished: Cell<bool>,
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine").field("finished", &self.finished.get()).finish()
    }
}

impl Coroutine {
    /// Whether the coroutine's entry function has returned.
    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    fn step(co: &Rc<Coroutine>) {
        if co.finished.get() {
            return;
        }
        let still_running = {
            let mut slot = co.generator.borrow_mut();
            let generator = slot.as_mut().expect("generator installed before the first step");
            generator.resume().is_some()
        };
        if !still_running {
            co.finished.set(true);
            *co.generator.borrow_mut() = None;
        }
    }
}

/// A `Send`-free handle to manage the handful of bookkeeping details that do
/// need to survive across a suspend/resume cycle.
pub type SharedCoroutine = Rc<Coroutine>;

/// Passed to a coroutine's entry function; the only way to suspend.
///
/// Safety invariant: `scope` points at a `Scope` local to the generator's own
/// closure body. It stays valid for exactly as long as that closure's call
/// stack is live, which — because the generator is stackful and its stack is
/// pinned per spec §4.9's invariants — includes every point from which
/// `await_op` can be called, both before and after a suspension. The pointer
/// is never read outside of that call stack.
pub struct CoroutineHandle {
    scope: *mut Scope<(), ()>,
    coroutine: Weak<Coroutine>,
}

impl std::fmt::Debug for CoroutineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineHandle").finish_non_exhaustive()
    }
}

impl CoroutineHandle {
    /// Suspends the coroutine until `register`'s resume callback fires.
    ///
    /// `register` is called synchronously with a one-shot callback that the
    /// caller must invoke exactly once, from the loop thread, with the
    /// operation's result — typically by handing it to a stream's read/write
    /// callback or a timer. `await_op` itself does not return until that
    /// happens (suspending the coroutine's stack in the meantime).
    ///
    /// Returns `Err(ErrorKind::Cancelled)` without suspending if the loop is
    /// already stopping — per spec §4.9, a coroutine must not start new
    /// awaits once it has observed cancellation.
    pub fn await_op<T: 'static>(&self, register: impl FnOnce(Box<dyn FnOnce(T)>)) -> Result<T, Error> {
        let co = self
            .coroutine
            .upgrade()
            .expect("CoroutineHandle only calls await_op from inside its own coroutine's entry function");

        if co.loop_.borrow().is_stopping() {
            return Err(Error::new(ErrorKind::Cancelled, "loop is stopping; no new awaits are permitted"));
        }

        co.loop_.borrow_mut().inc_ref();
        let co_for_resume = co.clone();
        register(Box::new(move |result: T| {
            *co_for_resume.resume_slot.borrow_mut() = Some(Box::new(result));
            co_for_resume.loop_.borrow_mut().dec_ref();
            let co_for_step = co_for_resume.clone();
            co_for_resume.loop_.borrow_mut().start_timer(
                Duration::ZERO,
                Duration::ZERO,
                Box::new(move || Coroutine::step(&co_for_step)),
            );
        }));

        unsafe {
            (*self.scope).yield_(());
        }

        let value = co
            .resume_slot
            .borrow_mut()
            .take()
            .expect("resume slot is populated before the coroutine is stepped again");

        if co.loop_.borrow().is_stopping() {
            return Err(Error::new(ErrorKind::Cancelled, "loop stopped while this await was in flight"));
        }

        Ok(*value
            .downcast::<T>()
            .expect("resume value's type always matches what await_op was called with"))
    }
}

/// Starts a coroutine on `loop_` with a 128 KiB stack. See
/// [`start_with_stack_size`] to configure the stack.
pub fn start<F>(loop_: SharedLoop, entry: F) -> SharedCoroutine
where
    F: FnOnce(&CoroutineHandle) + 'static,
{
    start_with_stack_size(loop_, DEFAULT_STACK_SIZE, entry)
}

/// Starts a coroutine with an explicit stack size, in bytes. The generator
/// allocates and installs a trampoline, then takes its first step
/// immediately so the entry function runs synchronously up to its first
/// `await_op` before this call returns.
pub fn start_with_stack_size<F>(loop_: SharedLoop, stack_size: usize, entry: F) -> SharedCoroutine
where
    F: FnOnce(&CoroutineHandle) + 'static,
{
    let co = Rc::new(Coroutine {
        generator: RefCell::new(None),
        resume_slot: RefCell::new(None),
        loop_,
        finished: Cell::new(false),
    });
    let co_weak = Rc::downgrade(&co);

    let generator = Gn::new_scoped_opt(stack_size, move |mut scope: Scope<(), ()>| {
        let handle = CoroutineHandle {
            scope: &mut scope as *mut Scope<(), ()>,
            coroutine: co_weak.clone(),
        };
        entry(&handle);
    });
    *co.generator.borrow_mut() = Some(generator);

    Coroutine::step(&co);
    co
}
