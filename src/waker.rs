//! A no-op [`Waker`] used to drive a [`Future`](std::future::Future) from
//! contexts that supply their own resumption path out of band (a generator
//! driven synchronously, a blocking `wait()`). Resumption in those cases
//! does not go through `Waker::wake` at all, so the waker only needs to be
//! a harmless placeholder to satisfy `Context::from_waker`.

use std::task::{RawWaker, RawWakerVTable, Waker};

/// Builds a [`Waker`] that does nothing when woken.
pub fn noop() -> Waker {
    // Safety: the waker points to a vtable whose functions all do nothing.
    // Doing nothing is memory-safe for any raw data pointer, including a
    // null one.
    unsafe { Waker::from_raw(RAW_WAKER) }
}

const RAW_WAKER: RawWaker = RawWaker::new(std::ptr::null(), &VTABLE);
const VTABLE: RawWakerVTable = RawWakerVTable::new(clone, do_nothing, do_nothing, do_nothing);

unsafe fn clone(_: *const ()) -> RawWaker {
    RAW_WAKER
}
unsafe fn do_nothing(_: *const ()) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Context;

    #[test]
    fn noop_waker_can_build_a_context() {
        let waker = noop();
        let cx = Context::from_waker(&waker);
        let _ = cx;
        waker.wake_by_ref();
    }
}
