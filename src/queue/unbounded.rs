//! An unbounded MPMC queue (spec §4.6): a buffered item queue plus a
//! consumer wait-list. A `push` that finds a consumer already suspended in
//! [`pop`](Queue::pop) hands the value to exactly that consumer directly —
//! matching `queue.h`'s `push()`, which checks `_awaiters.empty()` and
//! resumes the oldest waiting promise with the value instead of buffering
//! it. Only when no consumer is waiting does the value go through the
//! buffer.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use crossbeam_queue::SegQueue;

use crate::awaiter::{Registration, WaitList};
use crate::error::{CoroError, Result};

/// Where a directly-handed-off value lands for a specific waiting consumer,
/// plus the flag [`Queue::unblock_pop`] uses to cancel it instead.
struct Waiting<T> {
    canceled: AtomicBool,
    slot: StdMutex<Option<T>>,
}

pub struct Queue<T> {
    buffer: SegQueue<T>,
    consumers: WaitList<Arc<Waiting<T>>>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Queue {
            buffer: SegQueue::new(),
            consumers: WaitList::new(),
        }
    }

    /// Pushes `value`. If a consumer is already suspended in
    /// [`pop`](Self::pop), hands the value directly to the oldest one;
    /// otherwise it lands in the buffer for the next `try_pop`/`pop`.
    pub fn push(&self, value: T) {
        match self
            .consumers
            .pop_front_with(value, |waiting, value| {
                *waiting.slot.lock().unwrap() = Some(value);
            }) {
            Ok(waker) => waker.wake(),
            Err(value) => self.buffer.push(value),
        }
    }

    /// Non-suspending pop: `None` if the buffer is currently empty.
    pub fn try_pop(&self) -> Option<T> {
        self.buffer.pop()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn pop(&self) -> PopFuture<'_, T> {
        PopFuture {
            queue: self,
            waiting: None,
        }
    }

    /// Cancels one waiting `pop()` with `CoroError::CanceledAwait` instead
    /// of a value — the timeout mechanism of spec §4.6. Returns `false` if
    /// no consumer was waiting.
    pub fn unblock_pop(&self) -> bool {
        match self.consumers.pop_front() {
            Some((waker, waiting)) => {
                waiting.canceled.store(true, Ordering::Release);
                waker.wake();
                true
            }
            None => false,
        }
    }
}

pub struct PopFuture<'a, T> {
    queue: &'a Queue<T>,
    waiting: Option<(Registration<Arc<Waiting<T>>>, Arc<Waiting<T>>)>,
}

impl<T> Future for PopFuture<'_, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some((_registration, waiting)) = this.waiting.take() {
            if waiting.canceled.load(Ordering::Acquire) {
                return Poll::Ready(Err(CoroError::CanceledAwait));
            }
            let value = waiting
                .slot
                .lock()
                .unwrap()
                .take()
                .expect("a woken consumer always has its value delivered first");
            return Poll::Ready(Ok(value));
        }

        if let Some(value) = this.queue.try_pop() {
            return Poll::Ready(Ok(value));
        }

        let waiting = Arc::new(Waiting {
            canceled: AtomicBool::new(false),
            slot: StdMutex::new(None),
        });
        match this.queue.consumers.register(cx.waker().clone(), waiting.clone()) {
            Ok(registration) => {
                this.waiting = Some((registration, waiting));
                Poll::Pending
            }
            Err(_) => {
                // No permanent close exists for this queue; unreachable in
                // practice, but handled for completeness.
                Poll::Ready(Err(CoroError::CanceledAwait))
            }
        }
    }
}

impl<T> Drop for PopFuture<'_, T> {
    fn drop(&mut self) {
        if let Some((registration, waiting)) = self.waiting.take() {
            // `None` means a concurrent `push`/`unblock_pop` already popped
            // us off the list; if it was a push, the value is sitting in
            // our slot with no one left to read it, so recover it into the
            // buffer instead of dropping it on the floor.
            if registration.cancel().is_none() {
                if let Some(value) = waiting.slot.lock().unwrap().take() {
                    self.queue.buffer.push(value);
                }
            }
        }
    }
}
