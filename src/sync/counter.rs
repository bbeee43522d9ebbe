//! An async countdown counter: waiters suspend until the count reaches
//! zero. The one-shot cousin of [`super::barrier::Barrier`] — no reset, no
//! leader, just "block until N events have happened."

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use crate::awaiter::{Registration, WaitList};

pub struct Counter {
    remaining: AtomicUsize,
    waiters: WaitList<()>,
}

impl Counter {
    pub fn new(initial: usize) -> Self {
        Counter {
            remaining: AtomicUsize::new(initial),
            waiters: WaitList::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Decrements the count by one. A no-op once the count has reached
    /// zero. Wakes every waiter the instant the count transitions to zero.
    pub fn count_down(&self) {
        loop {
            let current = self.remaining.load(Ordering::Acquire);
            if current == 0 {
                return;
            }
            if self
                .remaining
                .compare_exchange_weak(
                    current,
                    current - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                if current == 1 {
                    self.waiters.drain().wake_all();
                }
                return;
            }
        }
    }

    pub fn wait(&self) -> CounterWait<'_> {
        CounterWait {
            counter: self,
            registration: None,
        }
    }
}

pub struct CounterWait<'a> {
    counter: &'a Counter,
    registration: Option<Registration<()>>,
}

impl Future for CounterWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.registration.take().is_some() || this.counter.count() == 0 {
            return Poll::Ready(());
        }

        match this.counter.waiters.register(cx.waker().clone(), ()) {
            Ok(registration) => {
                this.registration = Some(registration);
                // The count may have reached zero between our check above
                // and registering; re-check so we never suspend forever.
                if this.counter.count() == 0 {
                    this.counter.waiters.drain().wake_all();
                }
                Poll::Pending
            }
            Err(()) => Poll::Ready(()),
        }
    }
}

impl Drop for CounterWait<'_> {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.cancel();
        }
    }
}
