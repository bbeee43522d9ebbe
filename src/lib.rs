//! Cooperative-concurrency primitives built on Rust's native `async`/`await`
//! as the stackless coroutine: futures/promises, eager and lazy tasks,
//! generators, synchronization (mutex/barrier/counter/condvar), MPMC queues,
//! a thread pool, a single-thread dispatcher, a wall-clock scheduler, and the
//! per-thread frame allocator cache backing all of the above.

pub mod alloc;
pub mod awaiter;
pub mod dispatcher;
pub mod error;
pub mod future;
pub mod generator;
pub mod policy;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod waker;

pub mod prelude {
    #[doc(hidden)]
    pub use crate::alloc::{CoroBox, FrameAllocConfig, FrameAllocator};
    #[doc(hidden)]
    pub use crate::dispatcher::Dispatcher;
    #[doc(hidden)]
    pub use crate::error::{CoroError, Result};
    #[doc(hidden)]
    pub use crate::future::{channel, Future, Promise};
    #[doc(hidden)]
    pub use crate::generator::{Generator, GeneratorState, NextResult, Yielder};
    #[doc(hidden)]
    pub use crate::policy::Policy;
    #[doc(hidden)]
    pub use crate::pool::ThreadPool;
    #[doc(hidden)]
    pub use crate::queue::{bounded, unbounded};
    #[doc(hidden)]
    pub use crate::scheduler::{Scheduler, TimerId};
    #[doc(hidden)]
    pub use crate::sync::{Barrier, Condvar, Counter, Mutex, MutexGuard};
    #[doc(hidden)]
    pub use crate::task::{LazyTask, Task};
}
