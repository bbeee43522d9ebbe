//! A bounded MPMC queue (spec §4.6): adds a capacity and a producer
//! wait-list to [`super::unbounded::Queue`]'s shape. A full push suspends;
//! a pop that frees a slot wakes only the FIFO-oldest blocked producer
//! (matching `limited_queue.h`'s `pop()`, which resumes exactly the front
//! of `_push_awaiters` per freed slot, not every waiter at once), and
//! symmetrically a push into an empty queue wakes only the oldest blocked
//! consumer.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crossbeam_queue::ArrayQueue;

use crate::awaiter::{Registration, WaitList};
use crate::error::{CoroError, Result};

type CancelFlag = Arc<AtomicBool>;

pub struct Queue<T> {
    buffer: ArrayQueue<T>,
    consumers: WaitList<CancelFlag>,
    producers: WaitList<CancelFlag>,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "a bounded queue needs positive capacity");
        Queue {
            buffer: ArrayQueue::new(capacity),
            consumers: WaitList::new(),
            producers: WaitList::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Non-suspending push: returns the value back if the queue was full.
    pub fn try_push(&self, value: T) -> std::result::Result<(), T> {
        self.buffer.push(value)?;
        if let Some((waker, _flag)) = self.consumers.pop_front() {
            waker.wake();
        }
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        let item = self.buffer.pop();
        if item.is_some() {
            if let Some((waker, _flag)) = self.producers.pop_front() {
                waker.wake();
            }
        }
        item
    }

    pub fn push(&self, value: T) -> PushFuture<'_, T> {
        PushFuture {
            queue: self,
            value: Some(value),
            waiting: None,
        }
    }

    pub fn pop(&self) -> PopFuture<'_, T> {
        PopFuture {
            queue: self,
            waiting: None,
        }
    }

    /// Cancels one waiting [`pop`](Self::pop). Returns `false` if none was
    /// waiting.
    pub fn unblock_pop(&self) -> bool {
        unblock_one(&self.consumers)
    }

    /// Cancels one waiting [`push`](Self::push). Returns `false` if none
    /// was waiting.
    pub fn unblock_push(&self) -> bool {
        unblock_one(&self.producers)
    }
}

fn unblock_one(list: &WaitList<CancelFlag>) -> bool {
    match list.pop_front() {
        Some((waker, flag)) => {
            flag.store(true, Ordering::Release);
            waker.wake();
            true
        }
        None => false,
    }
}

pub struct PushFuture<'a, T> {
    queue: &'a Queue<T>,
    value: Option<T>,
    waiting: Option<(Registration<CancelFlag>, CancelFlag)>,
}

impl<T> Future for PushFuture<'_, T> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some((_registration, flag)) = this.waiting.take() {
            if flag.load(Ordering::Acquire) {
                return Poll::Ready(Err(CoroError::CanceledAwait));
            }
        }

        let value = this.value.take().expect("PushFuture polled after completion");
        match this.queue.try_push(value) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(value) => {
                this.value = Some(value);
                let flag: CancelFlag = Arc::new(AtomicBool::new(false));
                match this.queue.producers.register(cx.waker().clone(), flag.clone()) {
                    Ok(registration) => {
                        this.waiting = Some((registration, flag));
                        Poll::Pending
                    }
                    Err(_) => Poll::Ready(Err(CoroError::CanceledAwait)),
                }
            }
        }
    }
}

impl<T> Drop for PushFuture<'_, T> {
    fn drop(&mut self) {
        if let Some((registration, _flag)) = self.waiting.take() {
            let _ = registration.cancel();
        }
    }
}

pub struct PopFuture<'a, T> {
    queue: &'a Queue<T>,
    waiting: Option<(Registration<CancelFlag>, CancelFlag)>,
}

impl<T> Future for PopFuture<'_, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some((_registration, flag)) = this.waiting.take() {
            if flag.load(Ordering::Acquire) {
                return Poll::Ready(Err(CoroError::CanceledAwait));
            }
        }

        if let Some(value) = this.queue.try_pop() {
            return Poll::Ready(Ok(value));
        }

        let flag: CancelFlag = Arc::new(AtomicBool::new(false));
        match this.queue.consumers.register(cx.waker().clone(), flag.clone()) {
            Ok(registration) => {
                this.waiting = Some((registration, flag));
                Poll::Pending
            }
            Err(_) => Poll::Ready(Err(CoroError::CanceledAwait)),
        }
    }
}

impl<T> Drop for PopFuture<'_, T> {
    fn drop(&mut self) {
        if let Some((registration, _flag)) = self.waiting.take() {
            let _ = registration.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: Future>(mut fut: F) -> F::Output {
        use crate::waker::noop;
        let waker = noop();
        let mut cx = Context::from_waker(&waker);
        let mut fut = unsafe { Pin::new_unchecked(&mut fut) };
        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(v) => return v,
                Poll::Pending => std::thread::yield_now(),
            }
        }
    }

    #[test]
    fn try_push_fails_once_full() {
        let queue = Queue::new(2);
        assert!(queue.try_push(1).is_ok());
        assert!(queue.try_push(2).is_ok());
        assert_eq!(queue.try_push(3), Err(3));
    }

    #[test]
    fn blocked_push_completes_once_a_slot_frees_up() {
        let queue = Arc::new(Queue::new(1));
        queue.try_push(1).unwrap();

        let writer = {
            let queue = queue.clone();
            std::thread::spawn(move || block_on(queue.push(2)))
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(queue.try_pop(), Some(1));
        writer.join().unwrap().unwrap();
        assert_eq!(queue.try_pop(), Some(2));
    }

    #[test]
    fn unblock_push_cancels_a_waiting_producer() {
        let queue = Arc::new(Queue::new(1));
        queue.try_push(1).unwrap();

        let writer = {
            let queue = queue.clone();
            std::thread::spawn(move || block_on(queue.push(2)))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(queue.unblock_push());
        assert!(matches!(writer.join().unwrap(), Err(CoroError::CanceledAwait)));
    }

    #[test]
    fn a_pop_wakes_only_the_oldest_blocked_producer() {
        // With a capacity-1 queue and two blocked producers, freeing a
        // single slot must let exactly one of them complete its push, not
        // both racing the same slot.
        let queue = Arc::new(Queue::new(1));
        queue.try_push(0).unwrap();

        let first = {
            let queue = queue.clone();
            std::thread::spawn(move || block_on(queue.push(1)))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        let second = {
            let queue = queue.clone();
            std::thread::spawn(move || block_on(queue.push(2)))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));

        assert_eq!(queue.try_pop(), Some(0));
        first.join().unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        // The second producer must still be blocked: only one wake was
        // issued for the one freed slot.
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop(), Some(1));
        second.join().unwrap().unwrap();
    }

    #[test]
    fn dropping_a_blocked_push_future_does_not_leak_its_waiter() {
        let queue = Arc::new(Queue::new(1));
        queue.try_push(1).unwrap();

        let fut = queue.push(2);
        let mut fut = Box::pin(fut);
        let waker = crate::waker::noop();
        let mut cx = Context::from_waker(&waker);
        assert!(fut.as_mut().poll(&mut cx).is_pending());
        drop(fut);

        // The queue must not think a producer is still waiting: a freed
        // slot should not try to wake a waker that no longer exists.
        assert_eq!(queue.try_pop(), Some(1));
        assert!(!queue.unblock_push());
    }
}
