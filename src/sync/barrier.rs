//! A cyclic barrier (spec: "Mutex, barrier, counter, condvar ... wait-lists
//! specialized to each primitive's semantics"): `parties` tasks must all
//! call `wait()` before any of them proceeds, and the barrier resets itself
//! for reuse.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::task::{Context, Poll};

use crate::awaiter::{Registration, WaitList};

struct State {
    remaining: usize,
}

/// A reusable rendezvous point for a fixed number of tasks.
pub struct Barrier {
    parties: usize,
    state: StdMutex<State>,
    waiters: WaitList<()>,
}

/// Returned by [`Barrier::wait`]: exactly one waiter per generation observes
/// `is_leader == true`, the one whose arrival completed the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierWaitResult {
    pub is_leader: bool,
}

impl Barrier {
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "a barrier needs at least one party");
        Barrier {
            parties,
            state: StdMutex::new(State { remaining: parties }),
            waiters: WaitList::new(),
        }
    }

    pub fn wait(&self) -> BarrierWait<'_> {
        BarrierWait {
            barrier: self,
            registration: None,
        }
    }
}

pub struct BarrierWait<'a> {
    barrier: &'a Barrier,
    registration: Option<Registration<()>>,
}

impl Future for BarrierWait<'_> {
    type Output = BarrierWaitResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.registration.take().is_some() {
            return Poll::Ready(BarrierWaitResult { is_leader: false });
        }

        let mut state = this.barrier.state.lock().unwrap();
        state.remaining -= 1;
        if state.remaining == 0 {
            state.remaining = this.barrier.parties;
            drop(state);
            this.barrier.waiters.drain().wake_all();
            return Poll::Ready(BarrierWaitResult { is_leader: true });
        }
        drop(state);

        match this.barrier.waiters.register(cx.waker().clone(), ()) {
            Ok(registration) => {
                this.registration = Some(registration);
                Poll::Pending
            }
            Err(()) => Poll::Ready(BarrierWaitResult { is_leader: false }),
        }
    }
}

impl Drop for BarrierWait<'_> {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.cancel();
        }
    }
}
