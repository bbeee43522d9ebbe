//! A wall-clock scheduler layered on a thread pool (spec §4.10):
//! `sleep_until`/`sleep_for` awaiters, `cancel(id)`, and a periodic
//! `interval(dur)` generator.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use log::trace;

use crate::error::{CoroError, Result};
use crate::generator::{Generator, NextResult};
use crate::pool::ThreadPool;

/// Opaque handle returned by [`Scheduler::sleep_until`]/[`sleep_for`],
/// usable with [`Scheduler::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct Entry {
    at: Instant,
    seq: u64,
    id: TimerId,
    waker: Mutex<Option<Waker>>,
    fired: AtomicBool,
    canceled: AtomicBool,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct Shared {
    pool: Arc<ThreadPool>,
    heap: Mutex<BinaryHeap<Reverse<Arc<Entry>>>>,
    condvar: Condvar,
    next_seq: AtomicU64,
    shutdown: AtomicBool,
}

/// A scheduler running its own coordinator thread on top of a
/// [`ThreadPool`] (spec §4.10).
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        let shared = Arc::new(Shared {
            pool,
            heap: Mutex::new(BinaryHeap::new()),
            condvar: Condvar::new(),
            next_seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("coro-scheduler".to_string())
                .spawn(move || coordinator_loop(shared))
                .expect("failed to spawn scheduler coordinator thread")
        };

        Scheduler {
            shared,
            worker: Some(worker),
        }
    }

    pub fn sleep_until(&self, at: Instant) -> SleepFuture {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            at,
            seq,
            id: TimerId(seq),
            waker: Mutex::new(None),
            fired: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
        });
        {
            let mut heap = self.shared.heap.lock().unwrap();
            heap.push(Reverse(entry.clone()));
        }
        self.shared.condvar.notify_one();
        SleepFuture { entry }
    }

    pub fn sleep_for(&self, duration: Duration) -> SleepFuture {
        self.sleep_until(Instant::now() + duration)
    }

    /// Cancels a pending sleep by id, resuming its awaiter immediately
    /// instead of at its scheduled time.
    pub fn cancel(&self, id: TimerId) -> bool {
        let heap = self.shared.heap.lock().unwrap();
        for Reverse(entry) in heap.iter() {
            if entry.id == id {
                entry.canceled.store(true, Ordering::Release);
                if let Some(waker) = entry.waker.lock().unwrap().take() {
                    waker.wake();
                }
                self.shared.condvar.notify_one();
                return true;
            }
        }
        false
    }

    /// A periodic generator yielding `()` every `period` (spec §4.10:
    /// "`interval(dur)` ... exposes a periodic generator").
    pub fn interval(self: &Arc<Self>, period: Duration) -> Generator<(), ()> {
        let scheduler = self.clone();
        Generator::new(move |y| async move {
            loop {
                // A canceled tick (there is no public way to cancel an
                // interval's own internal timer, but the result type is
                // shared with `sleep_for`) is treated the same as a fired
                // one: either way it is time to yield again.
                let _ = scheduler.sleep_for(period).await;
                y.yield_value(()).await;
            }
        })
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn coordinator_loop(shared: Arc<Shared>) {
    loop {
        let due: Vec<Arc<Entry>> = {
            let mut heap = shared.heap.lock().unwrap();
            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(Reverse(entry)) = heap.peek() {
                if entry.canceled.load(Ordering::Acquire) || entry.at <= now {
                    let Reverse(entry) = heap.pop().unwrap();
                    due.push(entry);
                } else {
                    break;
                }
            }
            due
        };

        if due.is_empty() {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            let mut heap = shared.heap.lock().unwrap();
            match heap.peek() {
                Some(Reverse(entry)) => {
                    let wait = entry.at.saturating_duration_since(Instant::now());
                    let _ = shared.condvar.wait_timeout(heap, wait).unwrap();
                }
                None => {
                    let _ = shared.condvar.wait(heap).unwrap();
                }
            }
            continue;
        }

        for entry in due {
            trace!("scheduler firing timer {}", entry.id.0);
            entry.fired.store(true, Ordering::Release);
            let pool = shared.pool.clone();
            if let Some(waker) = entry.waker.lock().unwrap().take() {
                pool.run_detached(async move {
                    waker.wake();
                });
            }
        }

        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
    }
}

/// A future resolving once its scheduled time arrives, or with
/// `CanceledAwait` if [`Scheduler::cancel`] fires first (spec §8 scenario 4).
pub struct SleepFuture {
    entry: Arc<Entry>,
}

impl SleepFuture {
    /// The id usable with [`Scheduler::cancel`] to resume this sleep early.
    pub fn id(&self) -> TimerId {
        self.entry.id
    }

    fn poll_state(&self) -> Option<Result<()>> {
        if self.entry.canceled.load(Ordering::Acquire) {
            Some(Err(CoroError::CanceledAwait))
        } else if self.entry.fired.load(Ordering::Acquire) {
            Some(Ok(()))
        } else {
            None
        }
    }
}

impl Future for SleepFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.poll_state() {
            return Poll::Ready(outcome);
        }
        *self.entry.waker.lock().unwrap() = Some(cx.waker().clone());
        // Re-check after registering in case the timer fired between the
        // check above and the store.
        match self.poll_state() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

/// Drives one `interval()` generator to completion on the calling thread,
/// a convenience for consumers outside a coroutine context. Exposed mainly
/// for tests; most callers drive the generator from their own coroutine.
pub fn next_tick(interval: &mut Generator<(), ()>) -> bool {
    matches!(interval.next_blocking(()), Ok(NextResult::Yielded(())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_for_resolves_after_its_duration() {
        let pool = Arc::new(ThreadPool::new(2));
        let scheduler = Scheduler::new(pool);
        let start = Instant::now();
        let task = scheduler
            .shared
            .pool
            .run(scheduler_sleep(&scheduler, Duration::from_millis(20)));
        task.join().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    async fn scheduler_sleep(scheduler: &Scheduler, duration: Duration) {
        scheduler.sleep_for(duration).await.unwrap();
    }

    #[test]
    fn cancel_resumes_a_pending_sleep_immediately() {
        let pool = Arc::new(ThreadPool::new(2));
        let scheduler = Arc::new(Scheduler::new(pool));
        let sleep = scheduler.sleep_for(Duration::from_secs(60));
        let id = sleep.entry.id;
        let scheduler2 = scheduler.clone();
        let handle = std::thread::spawn(move || {
            let waker = crate::waker::noop();
            let mut cx = Context::from_waker(&waker);
            let mut sleep = std::pin::pin!(sleep);
            loop {
                match sleep.as_mut().poll(&mut cx) {
                    Poll::Ready(result) => {
                        assert!(matches!(result, Err(CoroError::CanceledAwait)));
                        break;
                    }
                    Poll::Pending => std::thread::sleep(Duration::from_millis(5)),
                }
            }
            let _ = &scheduler2;
        });
        std::thread::sleep(Duration::from_millis(10));
        assert!(scheduler.cancel(id));
        handle.join().unwrap();
    }
}
