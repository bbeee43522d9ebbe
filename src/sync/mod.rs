//! Mutex, barrier, counter and condvar (spec: "wait-lists specialized to
//! each primitive's semantics"). Only the mutex's wait-list needs FIFO
//! fairness; the rest drain in whatever order they like.

mod barrier;
mod condvar;
mod counter;
mod mutex;

pub use barrier::{Barrier, BarrierWait, BarrierWaitResult};
pub use condvar::Condvar;
pub use counter::{Counter, CounterWait};
pub use mutex::{LockFuture, Mutex, MutexGuard};
