//! Resumption policies (spec §4.3): the "scheduling sink" contract that
//! decides *where* a task's continuation runs once it is woken.
//!
//! A [`Task`](crate::task::Task) polls its entire body with a single
//! [`std::task::Waker`] built from its own `Arc`, the same way the teacher's
//! `FunctionCoroutine::resume` builds one waker per poll and hands it to the
//! whole nested future tree. Because every `.await` point inside the body
//! stores a clone of *that* waker, waking any inner awaiter already routes
//! through the task's policy automatically — spec §4.3's `await_transform`
//! ("wrap foreign awaiters so resumption happens under the task's policy")
//! falls out of this structurally, with no separate wrapper type needed.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use log::{debug, warn};

/// The unit of work a [`Policy`] schedules: typically "poll this task's
/// future once more."
pub trait Runnable: Send + Sync {
    /// Runs the unit of work on whatever thread the policy chose.
    fn run(self: Arc<Self>);

    /// Called instead of `run` when the runnable can never be resumed
    /// because its target (a dispatcher thread) is gone. Default: run
    /// anyway, so policies that have no such failure mode need not override
    /// it.
    fn fail_home_thread_ended(self: Arc<Self>) {
        self.run();
    }

    /// Called instead of `run` when the runnable is discarded without ever
    /// being resumed (e.g. a thread pool shutting down with work still
    /// queued). Default: run anyway.
    fn cancel(self: Arc<Self>) {
        self.run();
    }
}

/// A resumption policy: decides where a [`Runnable`] actually executes.
#[derive(Clone)]
pub enum Policy {
    /// Resume synchronously on the calling stack.
    Immediate,
    /// Resume on a per-thread FIFO queue; nested resumes are enqueued
    /// instead of recursing, bounding stack growth from chained
    /// continuations.
    Queued,
    /// Resume on a thread pool. May be constructed uninitialized; see
    /// [`PoolPolicy::initialize`].
    Pool(PoolPolicy),
    /// Resume on a specific thread's dispatcher loop.
    Dispatcher(DispatcherPolicy),
}

impl Policy {
    pub fn resume(&self, runnable: Arc<dyn Runnable>) {
        match self {
            Policy::Immediate => runnable.run(),
            Policy::Queued => queued::resume(runnable),
            Policy::Pool(p) => p.resume(runnable),
            Policy::Dispatcher(d) => d.resume(runnable),
        }
    }
}

impl Default for Policy {
    /// The default policy (spec §4.3: "Queued (default)").
    fn default() -> Self {
        Policy::Queued
    }
}

mod queued {
    use super::*;

    thread_local! {
        static QUEUE: RefCell<VecDeque<Arc<dyn Runnable>>> = RefCell::new(VecDeque::new());
        static DRAINING: Cell<bool> = const { Cell::new(false) };
    }

    pub fn resume(runnable: Arc<dyn Runnable>) {
        QUEUE.with(|q| q.borrow_mut().push_back(runnable));

        if DRAINING.with(Cell::get) {
            // A drain loop further up this thread's call stack will pick
            // this runnable up; do not recurse.
            return;
        }

        DRAINING.with(|d| d.set(true));
        loop {
            let next = QUEUE.with(|q| q.borrow_mut().pop_front());
            match next {
                Some(r) => r.run(),
                None => break,
            }
        }
        DRAINING.with(|d| d.set(false));
    }
}

/// A thread-pool resumption policy. Can be created before the pool it will
/// submit to exists; runnables handed to [`Policy::resume`] in that window
/// are buffered and flushed by [`initialize`](PoolPolicy::initialize).
#[derive(Clone)]
pub struct PoolPolicy {
    inner: Arc<PoolPolicyInner>,
}

struct PoolPolicyInner {
    submit: OnceLock<Box<dyn Fn(Arc<dyn Runnable>) + Send + Sync>>,
    pending: Mutex<Vec<Arc<dyn Runnable>>>,
}

impl PoolPolicy {
    /// Creates a policy with no pool bound yet.
    pub fn uninitialized() -> Self {
        PoolPolicy {
            inner: Arc::new(PoolPolicyInner {
                submit: OnceLock::new(),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a policy already bound to a submission function (typically
    /// `ThreadPool::submit_runnable`).
    pub fn bound(submit: impl Fn(Arc<dyn Runnable>) + Send + Sync + 'static) -> Self {
        let policy = Self::uninitialized();
        policy.initialize(submit);
        policy
    }

    /// Binds this policy to a pool submission function. Flushes any
    /// runnables that arrived while the policy was uninitialized. A second
    /// call is a no-op (first binding wins).
    pub fn initialize(&self, submit: impl Fn(Arc<dyn Runnable>) + Send + Sync + 'static) {
        if self.inner.submit.set(Box::new(submit)).is_err() {
            return;
        }
        let pending: Vec<_> = std::mem::take(&mut *self.inner.pending.lock().unwrap());
        debug!("pool policy initialized, flushing {} pending runnable(s)", pending.len());
        let submit = self.inner.submit.get().unwrap();
        for r in pending {
            submit(r);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.submit.get().is_some()
    }

    fn resume(&self, runnable: Arc<dyn Runnable>) {
        match self.inner.submit.get() {
            Some(submit) => submit(runnable),
            None => self.inner.pending.lock().unwrap().push(runnable),
        }
    }
}

/// A dispatcher-bound resumption policy, capturing a weak reference to the
/// target dispatcher at coroutine-creation time (spec §4.3/§4.9).
#[derive(Clone)]
pub struct DispatcherPolicy {
    target: Weak<dyn DispatcherTarget>,
}

/// The narrow interface [`DispatcherPolicy`] needs from a dispatcher,
/// avoiding a hard dependency from `policy` onto `dispatcher`.
pub trait DispatcherTarget: Send + Sync {
    fn schedule_runnable(&self, runnable: Arc<dyn Runnable>);
}

impl DispatcherPolicy {
    pub fn new(target: Weak<dyn DispatcherTarget>) -> Self {
        DispatcherPolicy { target }
    }

    fn resume(&self, runnable: Arc<dyn Runnable>) {
        match self.target.upgrade() {
            Some(target) => target.schedule_runnable(runnable),
            None => {
                warn!("dispatcher policy: home thread has ended, canceling runnable");
                runnable.fail_home_thread_ended();
            }
        }
    }
}
