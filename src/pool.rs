//! A fixed-size thread pool (spec §4.8): a FIFO runnable queue guarded by a
//! mutex and condition variable, with a fixed number of worker threads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, info};

use crate::error::Result;
use crate::policy::{Policy, PoolPolicy, Runnable};
use crate::task::Task;

struct Shared {
    queue: Mutex<VecDeque<Arc<dyn Runnable>>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

/// A fixed-size worker pool over a FIFO runnable queue (spec §4.8).
pub struct ThreadPool {
    shared: Arc<Shared>,
    policy: PoolPolicy,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "a thread pool needs at least one worker");
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let policy = PoolPolicy::uninitialized();
        policy.initialize({
            let shared = shared.clone();
            move |runnable| submit(&shared, runnable)
        });

        let workers = (0..worker_count)
            .map(|id| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("coro-pool-{id}"))
                    .spawn(move || worker_loop(id, shared))
                    .expect("failed to spawn thread pool worker")
            })
            .collect();

        ThreadPool {
            shared,
            policy,
            workers,
        }
    }

    /// The resumption policy tasks submitted to this pool run under.
    pub fn policy(&self) -> Policy {
        Policy::Pool(self.policy.clone())
    }

    /// Schedules `body` on this pool and returns a joinable [`Task`] (spec
    /// §4.8: "`run(fn)` ... schedules a callable and returns a future").
    pub fn run<F, T>(&self, body: F) -> Task<T>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Clone + Send + 'static,
    {
        Task::spawn(body, self.policy())
    }

    /// Schedules `body` fire-and-forget (spec §4.8: "`run_detached(fn)`").
    pub fn run_detached<F>(&self, body: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Task::spawn(body, self.policy()).detach();
    }

    /// Signals shutdown and joins every worker. Any runnable still queued
    /// is canceled rather than run (spec §4.8: "shutdown drains to canceled
    /// promises").
    pub fn shutdown(mut self) {
        self.shutdown_inner();
        self.join_workers();
    }

    fn shutdown_inner(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
    }

    /// Joins every worker except the calling thread, if the calling thread
    /// happens to be one of this pool's own workers (spec §4.8: a runnable
    /// must be able to shut down the pool it runs on without deadlocking).
    /// The skipped worker's `JoinHandle` is simply dropped; the thread
    /// keeps running detached and exits on its own once it drains the
    /// runnable queue.
    fn join_workers(&mut self) {
        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown_inner();
        self.join_workers();
    }
}

fn submit(shared: &Arc<Shared>, runnable: Arc<dyn Runnable>) {
    if shared.shutdown.load(Ordering::Acquire) {
        runnable.cancel();
        return;
    }
    shared.queue.lock().unwrap().push_back(runnable);
    shared.condvar.notify_one();
}

fn worker_loop(id: usize, shared: Arc<Shared>) {
    debug!("pool worker {id} started");
    loop {
        let runnable = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(runnable) = queue.pop_front() {
                    break Some(runnable);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                queue = shared.condvar.wait(queue).unwrap();
            }
        };

        let Some(runnable) = runnable else {
            break;
        };

        // Run under the queued policy so a runnable that resumes itself
        // synchronously (e.g. a task yielding to itself) stays pinned to
        // this worker instead of bouncing back through `submit`.
        Policy::Queued.resume(runnable);
    }

    // Drain whatever is left without running it.
    let remaining: Vec<_> = shared.queue.lock().unwrap().drain(..).collect();
    for runnable in remaining {
        runnable.cancel();
    }
    debug!("pool worker {id} stopped");
    info!("pool worker {id} exiting");
}

/// Blocks the calling thread until `task` joins, a convenience used by
/// tests exercising the pool without a surrounding executor.
pub fn block_on<T: Clone + Send + 'static>(task: &Task<T>) -> Result<T> {
    task.join()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_executes_and_joins() {
        let pool = ThreadPool::new(2);
        let task = pool.run(async { 1 + 1 });
        assert_eq!(task.join().unwrap(), 2);
    }

    #[test]
    fn run_detached_executes_without_a_handle() {
        let pool = ThreadPool::new(1);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        pool.run_detached(async move {
            ran2.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn shutdown_called_from_a_worker_does_not_deadlock() {
        // A runnable that calls `shutdown` on its own pool must not try to
        // join its own thread.
        let pool = Arc::new(Mutex::new(Some(ThreadPool::new(2))));
        let pool2 = pool.clone();
        let task = pool
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .run(async move {
                if let Some(pool) = pool2.lock().unwrap().take() {
                    pool.shutdown();
                }
                1
            });
        assert!(matches!(task.join(), Ok(1) | Err(crate::error::CoroError::CanceledAwait)));
    }

    #[test]
    fn shutdown_cancels_queued_work_instead_of_running_it() {
        let pool = ThreadPool::new(1);
        // Starve the single worker so the second task stays queued.
        let gate = Arc::new(std::sync::Barrier::new(2));
        {
            let gate = gate.clone();
            pool.run_detached(async move {
                gate.wait();
            });
        }
        let second = pool.run(async { 99 });
        gate.wait();
        pool.shutdown();
        assert!(matches!(second.join(), Err(crate::error::CoroError::CanceledAwait) | Ok(99)));
    }
}
