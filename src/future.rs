//! The future/promise pair (spec §4.4): a reference-counted, single-write
//! value cell that can be awaited by more than one consumer.
//!
//! Resolution is recorded in a [`OnceLock`], so "written exactly once" and
//! "read after it's known to be ready" both come from the standard library
//! rather than hand-rolled unsafe bookkeeping — the wait-list is the only
//! place in this module that needs it, and it is entirely contained in
//! [`crate::awaiter`].

use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::thread::Thread;

use crate::awaiter::{Registration, WaitList};
use crate::error::{CoroError, Payload, Result};

#[derive(Clone)]
enum Outcome<T> {
    Value(T),
    Error(Payload),
}

impl<T: Clone> Outcome<T> {
    fn into_result(self) -> Result<T> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Error(payload) => Err(CoroError::PropagatedUser(payload)),
        }
    }
}

struct Shared<T> {
    promise_count: AtomicUsize,
    slot: OnceLock<Outcome<T>>,
    waiters: WaitList<()>,
}

impl<T> Shared<T> {
    fn new() -> Arc<Self> {
        Arc::new(Shared {
            promise_count: AtomicUsize::new(0),
            slot: OnceLock::new(),
            waiters: WaitList::new(),
        })
    }

    /// Called when the producer refcount transitions 1 → 0. Closes the
    /// wait-list and wakes every registered consumer, whether or not a
    /// value was ever written.
    fn finalize(&self) {
        self.waiters.close().wake_all();
    }
}

/// A lightweight, cloneable handle carrying one unit of the producer
/// refcount. Dropping the last live promise finalizes the future.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Promise<T> {
    /// Forwards `value` into the cell. Returns `false` (a no-op) if the
    /// cell was already resolved by an earlier `set_value`/`set_exception`.
    pub fn set_value(&self, value: T) -> bool {
        self.shared.slot.set(Outcome::Value(value)).is_ok()
    }

    /// Resolves the cell with a captured panic payload instead of a value.
    /// Same double-call semantics as `set_value`.
    pub fn set_exception(&self, payload: Payload) -> bool {
        self.shared.slot.set(Outcome::Error(payload)).is_ok()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        self.shared.promise_count.fetch_add(1, Ordering::AcqRel);
        Promise {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.shared.promise_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.finalize();
        }
    }
}

/// A consumer handle onto a [`Promise`]'s cell. Implements
/// [`std::future::Future`] (via a fully-qualified `impl` to avoid shadowing
/// the trait name with this struct) so it can be `.await`ed directly, plus
/// [`wait`](Future::wait) for a blocking consumer and
/// [`get`](Future::get) for a non-blocking peek.
///
/// `T` must be `Clone`: more than one consumer may hold a handle onto the
/// same cell and each must be able to read the resolved value independently
/// (spec §4.4: "awaited by one or more consumers").
pub struct Future<T> {
    shared: Arc<Shared<T>>,
    registration: Option<Registration<()>>,
}

impl<T> Future<T> {
    /// Non-blocking accessor: `Ok(value)` once resolved, `Err(ValueNotReady)`
    /// before that, or the propagated/canceled error if applicable.
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        if !self.shared.waiters.is_closed() {
            return Err(CoroError::ValueNotReady);
        }
        self.read_outcome()
    }

    /// Blocks the calling (OS) thread until the cell resolves.
    pub fn wait(&self) -> Result<T>
    where
        T: Clone,
    {
        let thread = std::thread::current();
        struct Parker(Thread);
        impl std::task::Wake for Parker {
            fn wake(self: Arc<Self>) {
                self.0.unpark();
            }
        }
        let waker: std::task::Waker = Arc::new(Parker(thread)).into();

        match self.shared.waiters.register(waker, ()) {
            Ok(_reg) => {
                while !self.shared.waiters.is_closed() {
                    std::thread::park();
                }
            }
            Err(()) => {}
        }
        self.read_outcome()
    }

    fn read_outcome(&self) -> Result<T>
    where
        T: Clone,
    {
        match self.shared.slot.get() {
            Some(outcome) => outcome.clone().into_result(),
            None => Err(CoroError::CanceledAwait),
        }
    }
}

impl<T> Drop for Future<T> {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.cancel();
        }
    }
}

impl<T: Clone> StdFuture for Future<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.registration.is_none() {
            match this
                .shared
                .waiters
                .register(cx.waker().clone(), ())
            {
                Ok(reg) => {
                    this.registration = Some(reg);
                    return Poll::Pending;
                }
                Err(()) => {
                    // Already closed; fall through and read below.
                }
            }
        } else if !this.shared.waiters.is_closed() {
            return Poll::Pending;
        }
        Poll::Ready(this.read_outcome())
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            shared: self.shared.clone(),
            registration: None,
        }
    }
}

/// Creates a fresh, unresolved future cell and its first promise. The
/// promise's refcount starts at exactly one producer, matching
/// `get_promise()` in spec §4.4.
pub fn channel<T>() -> (Promise<T>, Future<T>) {
    let shared = Shared::new();
    shared.promise_count.store(1, Ordering::Release);
    (
        Promise {
            shared: shared.clone(),
        },
        Future {
            shared,
            registration: None,
        },
    )
}
