//! An async condition variable paired with [`super::mutex::Mutex`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::awaiter::{Registration, WaitList};

use super::mutex::{Mutex, MutexGuard};

pub struct Condvar {
    waiters: WaitList<()>,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    pub fn new() -> Self {
        Condvar {
            waiters: WaitList::new(),
        }
    }

    /// Releases `guard`'s mutex, suspends until notified, then reacquires
    /// the same mutex before returning a fresh guard — the usual
    /// condition-variable contract, adapted to suspension instead of
    /// blocking.
    pub async fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex();
        drop(guard);
        Parked {
            cv: self,
            registration: None,
        }
        .await;
        mutex.lock().await
    }

    /// Wakes the oldest waiter, if any, leaving the rest queued.
    pub fn notify_one(&self) {
        if let Some((waker, ())) = self.waiters.pop_front() {
            waker.wake();
        }
    }

    pub fn notify_all(&self) {
        self.waiters.drain().wake_all();
    }
}

struct Parked<'a> {
    cv: &'a Condvar,
    registration: Option<Registration<()>>,
}

impl Future for Parked<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.registration.take().is_some() {
            return Poll::Ready(());
        }
        match this.cv.waiters.register(cx.waker().clone(), ()) {
            Ok(registration) => {
                this.registration = Some(registration);
                Poll::Pending
            }
            Err(()) => Poll::Ready(()),
        }
    }
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.cancel();
        }
    }
}
