//! Eager and lazy tasks (spec §4.3): a coroutine body driven to completion
//! under a [`Policy`], with its outcome published through the same
//! future/promise cell used everywhere else in this crate.
//!
//! A task keeps itself alive while its body is still pending by stashing a
//! strong `Arc` reference to itself in `retain`, the same self-owning trick
//! `async-task`-style executors use so a detached task isn't dropped
//! mid-poll just because its `Task` handle went away.

use std::future::Future as StdFuture;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake};

use log::trace;

use crate::alloc::CoroBox;
use crate::error::{self, CoroError, Result};
use crate::future::{self, Promise};
use crate::policy::{Policy, Runnable};

type BoxBody<T> = Pin<CoroBox<dyn StdFuture<Output = T> + Send>>;

struct Inner<T> {
    body: Mutex<Option<BoxBody<T>>>,
    policy: Policy,
    promise: Promise<Result<T>>,
    retain: Mutex<Option<Arc<Inner<T>>>>,
    started: AtomicBool,
}

impl<T: Send + 'static> Inner<T> {
    fn poll_once(self: &Arc<Self>) {
        let mut guard = self.body.lock().unwrap();
        let Some(mut body) = guard.take() else {
            // Already finished (or never started, for a detached task
            // resumed after completion — can't happen, but cheap to guard).
            return;
        };

        let waker = std::task::Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);

        let poll = panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)));

        match poll {
            Ok(Poll::Ready(value)) => {
                drop(guard.take());
                self.finish(Ok(value));
            }
            Ok(Poll::Pending) => {
                *guard = Some(body);
            }
            Err(panic_payload) => {
                drop(guard.take());
                self.finish(Err(CoroError::PropagatedUser(error::capture_panic(panic_payload))));
            }
        }
    }

    fn finish(self: &Arc<Self>, outcome: Result<T>) {
        trace!("task finished");
        self.promise.set_value(outcome);
        *self.retain.lock().unwrap() = None;
    }
}

impl<T: Send + 'static> Wake for Inner<T> {
    fn wake(self: Arc<Self>) {
        self.policy.resume(self);
    }
}

impl<T: Send + 'static> Runnable for Inner<T> {
    fn run(self: Arc<Self>) {
        self.poll_once();
    }

    fn fail_home_thread_ended(self: Arc<Self>) {
        *self.body.lock().unwrap() = None;
        self.finish(Err(CoroError::HomeThreadEnded));
    }

    fn cancel(self: Arc<Self>) {
        *self.body.lock().unwrap() = None;
        self.finish(Err(CoroError::CanceledAwait));
    }
}

/// An eagerly-started coroutine handle. The body is polled once immediately
/// upon construction (spec §4.3: "Task — eager"), under `policy`.
pub struct Task<T> {
    completion: future::Future<Result<T>>,
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Spawns `body`, starting it immediately under `policy`.
    pub fn spawn<F>(body: F, policy: Policy) -> Self
    where
        F: StdFuture<Output = T> + Send + 'static,
    {
        let (promise, completion) = future::channel();
        let inner = Arc::new(Inner {
            body: Mutex::new(Some(crate::alloc::box_future(body, &crate::alloc::default_allocator()))),
            policy,
            promise,
            retain: Mutex::new(None),
            started: AtomicBool::new(true),
        });
        *inner.retain.lock().unwrap() = Some(inner.clone());
        inner.policy.resume(inner);
        Task { completion }
    }

    /// Detaches the task: the body keeps running to completion (kept alive
    /// by its own `retain` slot) but its outcome is discarded once ready.
    pub fn detach(self) {
        drop(self);
    }

    /// Blocks the calling thread until the task's body has finished running,
    /// returning its outcome (or the captured panic/cancellation).
    pub fn join(&self) -> Result<T> {
        flatten(self.completion.wait())
    }
}

impl<T: Clone + Send + 'static> StdFuture for Task<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.completion).poll(cx).map(flatten)
    }
}

/// A deferred-start coroutine handle: the body does not begin running until
/// the task is first polled or joined (spec §4.3: "LazyTask — deferred").
/// Resumption after that first poll goes through `policy` like any other
/// task.
pub struct LazyTask<T> {
    inner: Option<Arc<Inner<T>>>,
    completion: future::Future<Result<T>>,
}

impl<T: Clone + Send + 'static> LazyTask<T> {
    pub fn new<F>(body: F, policy: Policy) -> Self
    where
        F: StdFuture<Output = T> + Send + 'static,
    {
        let (promise, completion) = future::channel();
        let inner = Arc::new(Inner {
            body: Mutex::new(Some(crate::alloc::box_future(body, &crate::alloc::default_allocator()))),
            policy,
            promise,
            retain: Mutex::new(None),
            started: AtomicBool::new(false),
        });
        LazyTask {
            inner: Some(inner),
            completion,
        }
    }

    fn ensure_started(&mut self) {
        if let Some(inner) = self.inner.take() {
            if inner.started.swap(true, Ordering::AcqRel) {
                return;
            }
            *inner.retain.lock().unwrap() = Some(inner.clone());
            inner.poll_once();
        }
    }

    pub fn join(mut self) -> Result<T> {
        self.ensure_started();
        flatten(self.completion.wait())
    }
}

impl<T: Clone + Send + 'static> StdFuture for LazyTask<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.ensure_started();
        Pin::new(&mut this.completion).poll(cx).map(flatten)
    }
}

fn flatten<T>(outer: Result<Result<T>>) -> Result<T> {
    match outer {
        Ok(inner) => inner,
        Err(e) => Err(e),
    }
}
