//! The error taxonomy shared by every primitive in this crate.
//!
//! The library never swallows a user exception: panics raised inside a task
//! or generator body are captured at the first poll that observes them and
//! re-raised (as a panic, via [`CoroError::resume_unwind`]) at the first
//! consumer that awaits the resolved future. Cancellation uses the same
//! propagation mechanism with a fixed error kind instead of a captured panic.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A captured user panic, ready to be re-raised at the consumer site.
///
/// `catch_unwind` only hands back a `Box<dyn Any + Send>` — no `Sync` bound,
/// since most panic payloads (a `String`, a custom error) have no reason to
/// be one. Wrapping it in a `Mutex` is what actually makes the `Arc` around
/// it `Send + Sync` regardless of the payload's own bounds, which is what
/// lets a future with multiple consumers (spec §4.4) share one payload.
/// Whichever consumer calls [`CoroError::resume_unwind`] first takes the box
/// out; later callers still on the same `CoroError` get a stand-in panic
/// instead of the original payload.
pub type Payload = Arc<Mutex<Option<Box<dyn Any + Send + 'static>>>>;

pub(crate) fn capture_panic(payload: Box<dyn Any + Send + 'static>) -> Payload {
    Arc::new(Mutex::new(Some(payload)))
}

/// Errors surfaced by awaiting, polling, or driving a primitive in this crate.
///
/// `Clone` falls out for free: every variant is either a unit case or holds
/// an `Arc`/`&'static str`. `Task::join` relies on this to store a task's
/// outcome as a plain `Result<T>` inside a [`crate::future::Future`] cell,
/// which itself requires `Clone` to support more than one consumer.
#[derive(thiserror::Error, Clone)]
pub enum CoroError {
    /// An awaitable completed without producing a value, because every
    /// promise/producer that could have resolved it was released first.
    #[error("awaited value was canceled: no producer resolved it before release")]
    CanceledAwait,

    /// A synchronous accessor (`Future::get`) was called before the value
    /// existed.
    #[error("value is not ready yet")]
    ValueNotReady,

    /// A generator reached its end and the consumer asked for another value.
    #[error("generator has no more values to produce")]
    NoMoreValues,

    /// A broadcast subscriber fell behind the publisher's minimum retention
    /// window and can no longer catch up.
    #[error("subscriber fell too far behind and can no longer be served")]
    NoLongerAvailable,

    /// A dispatcher-policy task's owning dispatcher terminated before the
    /// task was resumed.
    #[error("the task's home dispatcher thread has ended")]
    HomeThreadEnded,

    /// Debug-only misuse detected at a call site that the public API cannot
    /// prevent at compile time: re-entrant calls into one [`crate::generator::Generator`]
    /// (spec §4.3's single-awaiter generator body polled a second time while
    /// already running), or a [`crate::alloc`] size-class mismatch on
    /// deallocation.
    #[error("misuse detected: {0}")]
    MisuseAssertion(&'static str),

    /// An exception (panic) raised inside a coroutine body, captured and
    /// re-thrown at the consumer's resume point.
    #[error("coroutine body panicked")]
    PropagatedUser(Payload),
}

impl CoroError {
    /// Re-raises a captured user panic as a panic on the current thread, or
    /// returns `self` unchanged if it does not carry one.
    pub fn resume_unwind(self) -> Self {
        match self {
            CoroError::PropagatedUser(payload) => {
                let taken = payload.lock().unwrap().take();
                match taken {
                    Some(boxed) => std::panic::resume_unwind(boxed),
                    None => panic!("coroutine body panicked (payload already re-raised elsewhere)"),
                }
            }
            other => other,
        }
    }

    pub(crate) fn misuse(msg: &'static str) -> Self {
        CoroError::MisuseAssertion(msg)
    }
}

impl fmt::Debug for CoroError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoroError::CanceledAwait => write!(f, "CanceledAwait"),
            CoroError::ValueNotReady => write!(f, "ValueNotReady"),
            CoroError::NoMoreValues => write!(f, "NoMoreValues"),
            CoroError::NoLongerAvailable => write!(f, "NoLongerAvailable"),
            CoroError::HomeThreadEnded => write!(f, "HomeThreadEnded"),
            CoroError::MisuseAssertion(m) => write!(f, "MisuseAssertion({m:?})"),
            CoroError::PropagatedUser(_) => write!(f, "PropagatedUser(..)"),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoroError>;
