//! The awaiter protocol and the wait-list every primitive in this crate is
//! built on (spec §4.1).
//!
//! A [`WaitList`] is a FIFO queue of parked wakers guarded by a single
//! [`parking_lot::Mutex`]: registering pushes an entry to the back, draining
//! takes entries from the front. Every registration carries a small
//! monotonic id, so a future that stops waiting before it was ever woken can
//! remove exactly its own entry through [`Registration::cancel`] — safely,
//! because both removal paths (a drain/close, or a cancel) serialize through
//! the same lock. There is no window where a node can be freed by one side
//! while the other still holds a pointer to it, the hazard a lock-free
//! linked structure would have to solve with epoch reclamation instead.

use std::collections::VecDeque;
use std::task::Waker;

use parking_lot::Mutex;

/// A single queued waiter: its registration id, waker, and payload.
struct Entry<T> {
    id: u64,
    waker: Waker,
    payload: T,
}

struct ListState<T> {
    closed: bool,
    next_id: u64,
    waiters: VecDeque<Entry<T>>,
}

/// A FIFO wait-list with a closeable "ready" terminal state.
///
/// `T` is a small piece of data carried alongside the waker (e.g. the
/// waiting producer's item for a bounded queue, or `()` when nothing extra
/// is needed).
pub struct WaitList<T = ()> {
    state: Mutex<ListState<T>>,
}

impl<T> Default for WaitList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaitList<T> {
    pub const fn new() -> Self {
        WaitList {
            state: Mutex::new(ListState {
                closed: false,
                next_id: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Registers `waker` (with `payload`) at the back of the list.
    ///
    /// Returns `Ok(Registration)` if the entry was queued and the caller
    /// should suspend, or `Err(payload)` if the list is already closed and
    /// the caller should proceed without suspending.
    pub fn register(&self, waker: Waker, payload: T) -> Result<Registration<T>, T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(payload);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.waiters.push_back(Entry { id, waker, payload });
        Ok(Registration {
            list: self as *const WaitList<T>,
            id,
        })
    }

    /// Takes every currently-queued entry, oldest first. The list remains
    /// open for further registration.
    pub fn drain(&self) -> NodeChain<T> {
        let mut state = self.state.lock();
        NodeChain {
            entries: std::mem::take(&mut state.waiters),
        }
    }

    /// Closes the list permanently and returns whatever was queued, oldest
    /// first. Safe to call more than once; later calls return an empty
    /// chain.
    pub fn close(&self) -> NodeChain<T> {
        let mut state = self.state.lock();
        state.closed = true;
        NodeChain {
            entries: std::mem::take(&mut state.waiters),
        }
    }

    /// True once [`close`](Self::close) has run on this list.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Pops exactly the oldest queued entry, if any, leaving the rest of the
    /// list untouched. Used where admission must hand off to the single
    /// oldest waiter rather than broadcasting to all of them (spec §4.6).
    pub fn pop_front(&self) -> Option<(Waker, T)> {
        let mut state = self.state.lock();
        state.waiters.pop_front().map(|e| (e.waker, e.payload))
    }

    /// Pops the oldest queued entry and, while still holding the list's
    /// lock, lets `apply` act on `arg` using that entry's payload. Returns
    /// the popped waker on success, or `arg` back unchanged if no one was
    /// waiting.
    ///
    /// Running `apply` under the same lock that a concurrent
    /// [`Registration::cancel`] acquires is what makes a direct value
    /// hand-off race-free: a canceling waiter can never observe "already
    /// removed from the list" before `apply` has actually run, so a value
    /// handed off this way is never silently dropped.
    pub fn pop_front_with<A>(
        &self,
        arg: A,
        apply: impl FnOnce(&T, A),
    ) -> std::result::Result<Waker, A> {
        let mut state = self.state.lock();
        match state.waiters.pop_front() {
            Some(entry) => {
                apply(&entry.payload, arg);
                Ok(entry.waker)
            }
            None => Err(arg),
        }
    }

    /// Removes the entry with id `id` if it is still queued, returning its
    /// payload. `None` if a concurrent drain/close/pop already took it.
    fn remove(&self, id: u64) -> Option<T> {
        let mut state = self.state.lock();
        let idx = state.waiters.iter().position(|e| e.id == id)?;
        Some(state.waiters.remove(idx).unwrap().payload)
    }
}

/// A pending registration on a [`WaitList`]. Dropping it without canceling
/// is harmless — the entry is simply reclaimed whenever the list is next
/// drained or closed — but a future that stops waiting before that should
/// call [`cancel`](Registration::cancel) so a long-lived list doesn't
/// accumulate entries for waiters nobody will ever wake.
#[must_use = "a Registration should be canceled once the caller stops waiting"]
pub struct Registration<T> {
    list: *const WaitList<T>,
    id: u64,
}

impl<T> Registration<T> {
    /// Removes this registration, returning its payload if it was still
    /// queued, or `None` if a concurrent drain/close/pop already took it
    /// (meaning this waiter has already been, or is in the middle of being,
    /// woken).
    ///
    /// Every caller of [`WaitList::register`] in this crate keeps the list
    /// alive at least as long as the `Registration` it returned — either
    /// because both live in the same owning struct (barrier/counter/condvar/
    /// queue all borrow their list by reference), or because the
    /// registration is explicitly dropped before the `Arc` holding the list
    /// is (`future::Future`'s `Drop` cancels its registration first, and
    /// only then lets its `Arc<Shared<T>>` field drop on its own). So the
    /// pointer dereferenced here is always valid.
    pub fn cancel(self) -> Option<T> {
        // Safety: see the struct-level note above.
        unsafe { (*self.list).remove(self.id) }
    }
}

unsafe impl<T: Send> Send for Registration<T> {}

/// The result of draining a [`WaitList`]: an owned FIFO chain of entries.
pub struct NodeChain<T> {
    entries: VecDeque<Entry<T>>,
}

impl<T> NodeChain<T> {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wakes every entry in the chain, oldest first.
    pub fn wake_all(self) {
        for entry in self.entries {
            entry.waker.wake();
        }
    }
}

impl<T> IntoIterator for NodeChain<T> {
    type Item = (Waker, T);
    type IntoIter =
        std::iter::Map<std::collections::vec_deque::IntoIter<Entry<T>>, fn(Entry<T>) -> (Waker, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter().map(|e| (e.waker, e.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waker::noop;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn register_then_drain_wakes_exactly_once() {
        let list: WaitList<()> = WaitList::new();
        let woke = Arc::new(AtomicUsize::new(0));

        struct CountingWake(Arc<AtomicUsize>);
        impl std::task::Wake for CountingWake {
            fn wake(self: Arc<Self>) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
        let waker: Waker = Arc::new(CountingWake(woke.clone())).into();

        list.register(waker, ()).unwrap();
        list.drain().wake_all();
        assert_eq!(woke.load(std::sync::atomic::Ordering::SeqCst), 1);

        // A second drain on an already-empty list is a no-op.
        list.drain().wake_all();
        assert_eq!(woke.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn close_refuses_further_registration() {
        let list: WaitList<u32> = WaitList::new();
        list.close().wake_all();
        assert!(list.is_closed());

        let waker = noop();
        match list.register(waker, 7) {
            Err(payload) => assert_eq!(payload, 7),
            Ok(_) => panic!("closed list must refuse registration"),
        }
    }

    #[test]
    fn drain_preserves_fifo_registration_order() {
        let list: WaitList<u32> = WaitList::new();
        for i in 0..5u32 {
            list.register(noop(), i).unwrap();
        }
        let order: Vec<u32> = list.drain().into_iter().map(|(_, p)| p).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancel_reclaims_without_waking() {
        let list: WaitList<u32> = WaitList::new();
        let reg = list.register(noop(), 42).unwrap();
        let payload = reg.cancel();
        assert_eq!(payload, Some(42));
        assert!(list.drain().is_empty());
    }

    #[test]
    fn cancel_after_a_concurrent_drain_returns_none() {
        let list: WaitList<u32> = WaitList::new();
        let reg = list.register(noop(), 42).unwrap();
        // Simulates a concurrent drain winning the race: the entry is gone
        // by the time `cancel` runs, and `cancel` must say so rather than
        // double-free or return a stale payload.
        list.drain().wake_all();
        assert_eq!(reg.cancel(), None);
    }

    #[test]
    fn pop_front_with_delivers_under_the_same_lock_as_cancel() {
        let list: WaitList<Arc<Mutex<Option<u32>>>> = WaitList::new();
        let slot = Arc::new(Mutex::new(None));
        let reg = list.register(noop(), slot.clone()).unwrap();

        let result = list.pop_front_with(99u32, |slot, value| {
            *slot.lock() = Some(value);
        });
        assert!(result.is_ok());
        assert_eq!(*slot.lock(), Some(99));
        // The entry is already gone; canceling now must not double-deliver.
        assert_eq!(reg.cancel(), None);
    }
}
