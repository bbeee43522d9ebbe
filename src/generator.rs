//! Generators (spec §4.7): a bidirectional coroutine that yields a sequence
//! of values and can be driven from ordinary code or awaited from another
//! coroutine.
//!
//! Modeled as the two-channel rendezvous spec §9's Open Questions note
//! suggests: one slot carries the driver's argument into the body, the
//! other carries the body's yielded value back out. The four states
//! (`NotStarted`/`Running`/`Ready`/`Done`) live in an `AtomicU8` because the
//! future `next()` returns can, like any future, end up polled from a
//! different thread than the one that called `next`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake};

use crate::alloc::CoroBox;
use crate::awaiter::WaitList;
use crate::error::{CoroError, Result};

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const READY: u8 = 2;
const DONE: u8 = 3;

struct Handle<Arg, Yield> {
    state: AtomicU8,
    arg_slot: Mutex<Option<Arg>>,
    yield_slot: Mutex<Option<Yield>>,
    /// Set just before `yield_value`'s inner future returns `Pending`, so
    /// the driver can tell "the body yielded" apart from "the body is
    /// awaiting something unrelated" — both present as `Poll::Pending`.
    produced: AtomicBool,
    arg_waiters: WaitList<()>,
}

impl<Arg, Yield> Handle<Arg, Yield> {
    fn new() -> Self {
        Handle {
            state: AtomicU8::new(NOT_STARTED),
            arg_slot: Mutex::new(None),
            yield_slot: Mutex::new(None),
            produced: AtomicBool::new(false),
            arg_waiters: WaitList::new(),
        }
    }
}

/// Handed to the body closure; lets the body produce a value and suspend
/// until the driver supplies the next argument.
pub struct Yielder<Arg, Yield> {
    handle: Arc<Handle<Arg, Yield>>,
}

impl<Arg, Yield> Clone for Yielder<Arg, Yield> {
    fn clone(&self) -> Self {
        Yielder {
            handle: self.handle.clone(),
        }
    }
}

impl<Arg, Yield> Yielder<Arg, Yield> {
    /// Stores `value` for the driver to observe, then suspends until the
    /// driver's next `next(arg)` call delivers the following argument.
    pub async fn yield_value(&self, value: Yield) -> Arg {
        *self.handle.yield_slot.lock().unwrap() = Some(value);
        self.handle.produced.store(true, Ordering::Release);

        let handle = &self.handle;
        std::future::poll_fn(move |cx| {
            if let Some(arg) = handle.arg_slot.lock().unwrap().take() {
                return Poll::Ready(arg);
            }
            match handle.arg_waiters.register(cx.waker().clone(), ()) {
                Ok(_registration) => Poll::Pending,
                Err(()) => Poll::Ready(
                    handle
                        .arg_slot
                        .lock()
                        .unwrap()
                        .take()
                        .expect("arg_waiters closed without ever delivering an argument"),
                ),
            }
        })
        .await
    }
}

/// The outcome of one `next()` step.
#[derive(Debug, Clone)]
pub enum NextResult<Yield> {
    Yielded(Yield),
    Done,
}

/// A bidirectional generator coroutine (spec §4.7).
pub struct Generator<Arg, Yield> {
    handle: Arc<Handle<Arg, Yield>>,
    body: Option<Pin<CoroBox<dyn Future<Output = ()> + Send>>>,
}

impl<Arg, Yield> Generator<Arg, Yield>
where
    Arg: Send + 'static,
    Yield: Send + 'static,
{
    /// Builds a generator whose body is produced by `make_body`, given a
    /// [`Yielder`] to call back into. The body does not start running until
    /// the first `next()`/`next_blocking()` call (spec: "not-started").
    pub fn new<F, Fut>(make_body: F) -> Self
    where
        F: FnOnce(Yielder<Arg, Yield>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = Arc::new(Handle::new());
        let yielder = Yielder {
            handle: handle.clone(),
        };
        Generator {
            handle,
            body: Some(crate::alloc::box_future(
                make_body(yielder),
                &crate::alloc::default_allocator(),
            )),
        }
    }

    pub fn state(&self) -> GeneratorState {
        match self.handle.state.load(Ordering::Acquire) {
            NOT_STARTED => GeneratorState::NotStarted,
            RUNNING => GeneratorState::Running,
            READY => GeneratorState::Ready,
            _ => GeneratorState::Done,
        }
    }

    /// Resumes the generator with `arg`, producing either the next yielded
    /// value or `Done`. If the body itself suspends on something unrelated
    /// to yielding, the returned future stays pending until that resolves,
    /// matching spec §4.7's "driver receives a pending future." The caller
    /// must keep polling that same future rather than dropping it and
    /// calling `next` again while the body is still running.
    pub fn next(&mut self, arg: Arg) -> impl Future<Output = Result<NextResult<Yield>>> + '_ {
        let mut arg = Some(arg);
        std::future::poll_fn(move |cx| {
            if self.body.is_none() {
                return Poll::Ready(Err(CoroError::NoMoreValues));
            }

            if let Some(a) = arg.take() {
                // The body is a single awaiter: a second `next()` call
                // overlapping one already driving the body would double-poll
                // it. The `&mut self` borrow the returned future holds
                // already rules this out through the safe API.
                let already_running = self.handle.state.load(Ordering::Acquire) == RUNNING;
                debug_assert!(!already_running, "generator body polled while already running");
                if already_running {
                    return Poll::Ready(Err(CoroError::misuse(
                        "generator body polled while already running",
                    )));
                }

                *self.handle.arg_slot.lock().unwrap() = Some(a);
                self.handle.arg_waiters.drain().wake_all();
            }

            self.handle.state.store(RUNNING, Ordering::Release);
            self.handle.produced.store(false, Ordering::Release);

            let body = self.body.as_mut().unwrap();
            match body.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    self.handle.state.store(DONE, Ordering::Release);
                    self.body = None;
                    Poll::Ready(Ok(NextResult::Done))
                }
                Poll::Pending => {
                    if self.handle.produced.swap(false, Ordering::AcqRel) {
                        self.handle.state.store(READY, Ordering::Release);
                        let value = self
                            .handle
                            .yield_slot
                            .lock()
                            .unwrap()
                            .take()
                            .expect("yield_value always stores before suspending");
                        Poll::Ready(Ok(NextResult::Yielded(value)))
                    } else {
                        Poll::Pending
                    }
                }
            }
        })
    }

    /// Blocking variant of [`next`](Self::next) for callers outside a
    /// coroutine context (spec §4.7: "driven... from a non-coroutine
    /// caller").
    pub fn next_blocking(&mut self, arg: Arg) -> Result<NextResult<Yield>> {
        struct Parker(std::thread::Thread);
        impl Wake for Parker {
            fn wake(self: Arc<Self>) {
                self.0.unpark();
            }
        }
        let waker: std::task::Waker = Arc::new(Parker(std::thread::current())).into();
        let mut cx = Context::from_waker(&waker);
        let mut fut = std::pin::pin!(self.next(arg));
        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(result) => return result,
                Poll::Pending => std::thread::park(),
            }
        }
    }
}

/// A snapshot of spec §4.7's four-state generator machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    NotStarted,
    Running,
    Ready,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drives_a_pure_yield_sequence_synchronously() {
        let mut gen = Generator::<(), u32>::new(|y| async move {
            y.yield_value(1).await;
            y.yield_value(2).await;
        });

        assert_eq!(gen.state(), GeneratorState::NotStarted);
        assert!(matches!(
            gen.next_blocking(()),
            Ok(NextResult::Yielded(1))
        ));
        assert_eq!(gen.state(), GeneratorState::Ready);
        assert!(matches!(
            gen.next_blocking(()),
            Ok(NextResult::Yielded(2))
        ));
        assert!(matches!(gen.next_blocking(()), Ok(NextResult::Done)));
        assert_eq!(gen.state(), GeneratorState::Done);
        assert!(matches!(
            gen.next_blocking(()),
            Err(CoroError::NoMoreValues)
        ));
    }

    #[test]
    fn arguments_flow_from_driver_into_the_body() {
        let mut gen = Generator::<i32, i32>::new(|y| async move {
            let mut total = 0;
            loop {
                total += y.yield_value(total).await;
                if total > 100 {
                    break;
                }
            }
        });

        assert!(matches!(
            gen.next_blocking(0),
            Ok(NextResult::Yielded(0))
        ));
        assert!(matches!(
            gen.next_blocking(50),
            Ok(NextResult::Yielded(50))
        ));
        assert!(matches!(
            gen.next_blocking(60),
            Ok(NextResult::Yielded(110))
        ));
        assert!(matches!(gen.next_blocking(0), Ok(NextResult::Done)));
    }

    #[test]
    fn completing_without_any_yield_reports_done_immediately() {
        let mut gen = Generator::<(), u32>::new(|_y| async move {});
        assert!(matches!(gen.next_blocking(()), Ok(NextResult::Done)));
    }
}
