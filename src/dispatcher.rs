//! A thread-local run loop (spec §4.9): a FIFO runnable queue plus a
//! wall-clock timer min-heap, owned by exactly one thread — the one that
//! called [`Dispatcher::init`].

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::thread::Thread;
use std::time::Instant;

use crate::policy::{DispatcherPolicy, DispatcherTarget, Policy, Runnable};

struct TimerEntry {
    at: Instant,
    seq: u64,
    runnable: Arc<dyn Runnable>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct Shared {
    owner_thread: Thread,
    queue: Mutex<VecDeque<Arc<dyn Runnable>>>,
    timers: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    next_seq: AtomicU64,
}

impl DispatcherTarget for Shared {
    fn schedule_runnable(&self, runnable: Arc<dyn Runnable>) {
        self.queue.lock().unwrap().push_back(runnable);
        self.owner_thread.unpark();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Shared>>> = const { RefCell::new(None) };
}

/// A single-thread dispatcher (spec §4.9). `init()` must run on the thread
/// that will own it; that thread drives the loop via
/// [`await_here`](Dispatcher::await_here), which may be called reentrantly.
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Initializes the calling thread's dispatcher, replacing any previous
    /// one that thread owned.
    pub fn init() -> Self {
        let shared = Arc::new(Shared {
            owner_thread: std::thread::current(),
            queue: Mutex::new(VecDeque::new()),
            timers: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
        });
        CURRENT.with(|c| *c.borrow_mut() = Some(shared.clone()));
        Dispatcher { shared }
    }

    /// Returns a handle to this thread's dispatcher, if [`init`](Self::init)
    /// was called on it.
    pub fn current() -> Option<Dispatcher> {
        CURRENT
            .with(|c| c.borrow().clone())
            .map(|shared| Dispatcher { shared })
    }

    /// The resumption policy for tasks that should run on this dispatcher's
    /// thread. Captures only a weak reference, per spec §4.9: if the
    /// dispatcher has terminated by the time a task under this policy
    /// wakes, the task is canceled with `HomeThreadEnded` instead.
    pub fn policy(&self) -> Policy {
        let weak: Weak<dyn DispatcherTarget> = Arc::downgrade(&self.shared);
        Policy::Dispatcher(DispatcherPolicy::new(weak))
    }

    pub fn schedule(&self, runnable: Arc<dyn Runnable>) {
        self.shared.schedule_runnable(runnable);
    }

    pub fn schedule_at(&self, runnable: Arc<dyn Runnable>, at: Instant) {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shared
            .timers
            .lock()
            .unwrap()
            .push(Reverse(TimerEntry { at, seq, runnable }));
        self.shared.owner_thread.unpark();
    }

    /// Drives this dispatcher's loop until `fut` resolves. Re-entrant: a
    /// runnable popped from the queue may itself call `await_here` again.
    pub fn await_here<F: Future>(&self, fut: F) -> F::Output {
        struct Parker(Thread);
        impl std::task::Wake for Parker {
            fn wake(self: Arc<Self>) {
                self.0.unpark();
            }
        }
        let waker: std::task::Waker = Arc::new(Parker(std::thread::current())).into();
        let mut cx = Context::from_waker(&waker);
        let mut fut = pin!(fut);

        loop {
            if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
                return out;
            }
            if self.run_one() {
                continue;
            }
            match self.next_timer_deadline() {
                Some(at) => {
                    let now = Instant::now();
                    if at > now {
                        std::thread::park_timeout(at - now);
                    }
                }
                None => std::thread::park(),
            }
        }
    }

    /// Promotes due timers into the queue, then runs at most one queued
    /// runnable under the queued resumption policy. Returns whether
    /// anything ran.
    fn run_one(&self) -> bool {
        self.promote_due_timers();
        let next = self.shared.queue.lock().unwrap().pop_front();
        match next {
            Some(runnable) => {
                Policy::Queued.resume(runnable);
                true
            }
            None => false,
        }
    }

    fn promote_due_timers(&self) {
        let now = Instant::now();
        loop {
            let mut timers = self.shared.timers.lock().unwrap();
            let due = matches!(timers.peek(), Some(Reverse(entry)) if entry.at <= now);
            if !due {
                return;
            }
            let Reverse(entry) = timers.pop().unwrap();
            drop(timers);
            self.shared.queue.lock().unwrap().push_back(entry.runnable);
        }
    }

    fn next_timer_deadline(&self) -> Option<Instant> {
        self.shared
            .timers
            .lock()
            .unwrap()
            .peek()
            .map(|Reverse(entry)| entry.at)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            let mut slot = c.borrow_mut();
            if matches!(slot.as_ref(), Some(current) if Arc::ptr_eq(current, &self.shared)) {
                *slot = None;
            }
        });
    }
}
