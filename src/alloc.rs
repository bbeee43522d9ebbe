//! Per-thread frame allocator cache (spec §4.2): every coroutine frame
//! (a spawned [`Task`](crate::task::Task)/[`LazyTask`](crate::task::LazyTask)
//! or [`Generator`](crate::generator::Generator) body) is boxed through
//! [`CoroBox`] rather than the global allocator directly.
//!
//! Sizes are rounded up to a step and bucketed into size classes, each
//! holding two free-list chains: `prepared` (ready to hand out) and
//! `dropped` (recently freed, not yet folded back in). A size class whose
//! `prepared`/`dropped` chains are both empty falls back to a shared global
//! spillover chain for that class before finally asking the heap, letting
//! threads with bursty allocation patterns borrow blocks freed elsewhere.

use std::alloc::Layout;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, OnceLock};

use crossbeam_utils::CachePadded;
use thread_local::ThreadLocal;

/// Coroutine frames are rarely over-aligned; anything requesting more than
/// this falls straight through to the heap regardless of size class.
const FRAME_ALIGN: usize = 16;

/// Tuning knobs for a [`FrameAllocator`] (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct FrameAllocConfig {
    /// Block sizes are rounded up to multiples of `step`.
    pub step: usize,
    /// Number of size classes; the largest serves blocks of `step * levels`
    /// bytes. Anything bigger falls through to the heap.
    pub levels: usize,
    /// Per-thread, per-size-class cap on cached bytes (`prepared` +
    /// `dropped` combined). Freed blocks beyond the cap are pushed to the
    /// global spillover chain instead of being kept on this thread.
    pub per_class_cap_bytes: usize,
    /// REDESIGN FLAG "Frame allocator disable": when `false`, every
    /// allocation/deallocation falls through to the heap and the cache is
    /// never touched.
    pub enabled: bool,
}

impl FrameAllocConfig {
    pub const fn new(step: usize, levels: usize, per_class_cap_bytes: usize) -> Self {
        FrameAllocConfig {
            step,
            levels,
            per_class_cap_bytes,
            enabled: true,
        }
    }

    /// REDESIGN FLAG "Frame allocator disable", applied up front.
    pub const fn disabled() -> Self {
        FrameAllocConfig {
            step: std::mem::size_of::<usize>() * 10,
            levels: 20,
            per_class_cap_bytes: 102_400,
            enabled: false,
        }
    }
}

impl Default for FrameAllocConfig {
    fn default() -> Self {
        FrameAllocConfig::new(std::mem::size_of::<usize>() * 10, 20, 102_400)
    }
}

/// An intrusive LIFO free list: each freed block's own first machine word
/// stores the pointer to the next block in the chain, so the chain costs no
/// extra memory beyond the blocks themselves.
struct Chain {
    head: Option<NonNull<u8>>,
}

// SAFETY: a `Chain` only ever holds pointers to blocks this allocator owns
// exclusively (between `dealloc` and the next `alloc` of the same block);
// nothing aliases them while they sit in a chain.
unsafe impl Send for Chain {}

impl Chain {
    const fn new() -> Self {
        Chain { head: None }
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Links `block` onto the front of the chain. `block` must point to at
    /// least `size_of::<usize>()` writable bytes.
    fn push(&mut self, block: NonNull<u8>) {
        unsafe {
            block.as_ptr().cast::<Option<NonNull<u8>>>().write(self.head);
        }
        self.head = Some(block);
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let block = self.head?;
        self.head = unsafe { block.as_ptr().cast::<Option<NonNull<u8>>>().read() };
        Some(block)
    }

    fn take(&mut self) -> Chain {
        std::mem::replace(self, Chain::new())
    }
}

struct ClassCache {
    prepared: Chain,
    dropped: Chain,
    cached_bytes: usize,
}

impl ClassCache {
    fn new() -> Self {
        ClassCache {
            prepared: Chain::new(),
            dropped: Chain::new(),
            cached_bytes: 0,
        }
    }
}

struct ThreadCache {
    classes: Vec<ClassCache>,
}

impl ThreadCache {
    fn new(levels: usize) -> Self {
        ThreadCache {
            classes: (0..levels).map(|_| ClassCache::new()).collect(),
        }
    }
}

struct GlobalClass {
    /// Cache-line padded: distinct size classes are hammered by unrelated
    /// threads concurrently, and without padding their `chain` locks would
    /// sit on the same cache line and false-share.
    chain: CachePadded<Mutex<Chain>>,
}

/// A per-thread size-classed free-list cache fronting the global allocator
/// (spec §4.2). Shared across threads via `Arc`; each thread keeps its own
/// `prepared`/`dropped` chains and only takes the `global` lock when its own
/// chains run dry or its cap is exceeded.
pub struct FrameAllocator {
    config: FrameAllocConfig,
    global: Vec<GlobalClass>,
    per_thread: ThreadLocal<std::cell::RefCell<ThreadCache>>,
}

impl FrameAllocator {
    pub fn new(config: FrameAllocConfig) -> Arc<Self> {
        let global = (0..config.levels)
            .map(|_| GlobalClass {
                chain: CachePadded::new(Mutex::new(Chain::new())),
            })
            .collect();
        Arc::new(FrameAllocator {
            config,
            global,
            per_thread: ThreadLocal::new(),
        })
    }

    fn class_for(&self, size: usize) -> Option<usize> {
        let steps = size.div_ceil(self.config.step.max(1)).max(1);
        if steps > self.config.levels {
            None
        } else {
            Some(steps - 1)
        }
    }

    fn block_layout(&self, class: usize) -> Layout {
        let size = self.config.step * (class + 1);
        Layout::from_size_align(size, FRAME_ALIGN).expect("frame size class layout is always valid")
    }

    pub fn alloc(&self, layout: Layout) -> *mut u8 {
        if !self.config.enabled || layout.align() > FRAME_ALIGN {
            return unsafe { std::alloc::alloc(layout) };
        }
        match self.class_for(layout.size()) {
            Some(class) => self.alloc_from_class(class),
            None => unsafe { std::alloc::alloc(layout) },
        }
    }

    /// # Safety
    /// `ptr` must have been returned by a matching call to
    /// [`alloc`](Self::alloc) on `self` with the same `layout`.
    pub fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if !self.config.enabled || layout.align() > FRAME_ALIGN {
            unsafe { std::alloc::dealloc(ptr, layout) };
            return;
        }
        match self.class_for(layout.size()) {
            Some(class) => {
                debug_assert!(
                    layout.size() <= self.block_layout(class).size(),
                    "misuse: frame-allocator size-class mismatch on dealloc"
                );
                self.dealloc_into_class(class, ptr)
            }
            None => unsafe { std::alloc::dealloc(ptr, layout) },
        }
    }

    fn alloc_from_class(&self, class: usize) -> *mut u8 {
        let cache = self
            .per_thread
            .get_or(|| std::cell::RefCell::new(ThreadCache::new(self.config.levels)));
        let mut cache = cache.borrow_mut();
        let entry = &mut cache.classes[class];

        if entry.prepared.is_empty() {
            if !entry.dropped.is_empty() {
                entry.prepared = entry.dropped.take();
            } else {
                let mut global = self.global[class].chain.lock().unwrap();
                if !global.is_empty() {
                    entry.prepared = global.take();
                }
            }
        }

        if let Some(block) = entry.prepared.pop() {
            let block_size = self.block_layout(class).size();
            entry.cached_bytes = entry.cached_bytes.saturating_sub(block_size);
            return block.as_ptr();
        }

        unsafe { std::alloc::alloc(self.block_layout(class)) }
    }

    fn dealloc_into_class(&self, class: usize, ptr: *mut u8) {
        let block_size = self.block_layout(class).size();
        let block = unsafe { NonNull::new_unchecked(ptr) };

        let cache = self
            .per_thread
            .get_or(|| std::cell::RefCell::new(ThreadCache::new(self.config.levels)));
        let mut cache = cache.borrow_mut();
        let entry = &mut cache.classes[class];

        if entry.cached_bytes + block_size > self.config.per_class_cap_bytes {
            // Over this thread's cap: hand it to the global chain instead of
            // the heap so other threads can still reuse it.
            self.global[class].chain.lock().unwrap().push(block);
            return;
        }
        entry.dropped.push(block);
        entry.cached_bytes += block_size;
    }
}

/// The process-wide default allocator used by [`crate::task`] and
/// [`crate::generator`] when no explicit [`FrameAllocator`] is supplied.
pub fn default_allocator() -> Arc<FrameAllocator> {
    static DEFAULT: OnceLock<Arc<FrameAllocator>> = OnceLock::new();
    DEFAULT
        .get_or_init(|| FrameAllocator::new(FrameAllocConfig::default()))
        .clone()
}

/// A `Box`-alike whose backing storage comes from a [`FrameAllocator`]
/// rather than the global allocator.
///
/// Like `Box`, moving a `CoroBox` only moves the pointer: the pointee's
/// address is stable for the `CoroBox`'s whole lifetime, and nothing safe
/// exposes a way to move the pointee out from under it. That is the same
/// argument `Box::pin` relies on, so `CoroBox` is unconditionally `Unpin`
/// and [`into_pin`](CoroBox::into_pin) can build a `Pin` without re-checking
/// the pointee's own `Unpin`-ness.
pub struct CoroBox<T: ?Sized> {
    ptr: NonNull<T>,
    alloc: Arc<FrameAllocator>,
}

// SAFETY: `CoroBox<T>` owns `T` exclusively, exactly like `Box<T>`.
unsafe impl<T: ?Sized + Send> Send for CoroBox<T> {}

impl<T: ?Sized> Unpin for CoroBox<T> {}

impl<T> CoroBox<T> {
    pub fn new(value: T, alloc: Arc<FrameAllocator>) -> Self {
        let layout = Layout::new::<T>();
        let raw = alloc.alloc(layout).cast::<T>();
        unsafe { raw.write(value) };
        CoroBox {
            ptr: NonNull::new(raw).expect("frame allocator returned a null pointer"),
            alloc,
        }
    }
}

impl<T: ?Sized> CoroBox<T> {
    pub fn into_pin(self) -> Pin<CoroBox<T>> {
        unsafe { Pin::new_unchecked(self) }
    }
}

impl<T: ?Sized> Deref for CoroBox<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ?Sized> DerefMut for CoroBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: ?Sized> Drop for CoroBox<T> {
    fn drop(&mut self) {
        unsafe {
            let layout = Layout::for_value(self.ptr.as_ref());
            std::ptr::drop_in_place(self.ptr.as_ptr());
            self.alloc.dealloc(self.ptr.as_ptr().cast::<u8>(), layout);
        }
    }
}

/// Boxes `body` through `alloc` and returns it as a pinned trait object,
/// the allocation path every [`Task`](crate::task::Task)/
/// [`LazyTask`](crate::task::LazyTask)/[`Generator`](crate::generator::Generator)
/// body goes through (spec §4.2: "every coroutine frame allocation").
pub fn box_future<F>(
    body: F,
    alloc: &Arc<FrameAllocator>,
) -> Pin<CoroBox<dyn Future<Output = F::Output> + Send>>
where
    F: Future + Send + 'static,
{
    let layout = Layout::new::<F>();
    let raw = alloc.alloc(layout).cast::<F>();
    unsafe { raw.write(body) };
    let fat: *mut (dyn Future<Output = F::Output> + Send) = raw;
    let boxed = CoroBox {
        ptr: NonNull::new(fat).expect("frame allocator returned a null pointer"),
        alloc: alloc.clone(),
    };
    boxed.into_pin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn allocating_within_a_size_class_reuses_freed_blocks() {
        let alloc = FrameAllocator::new(FrameAllocConfig::new(64, 4, 1024));
        let layout = Layout::from_size_align(40, 8).unwrap();

        let a = alloc.alloc(layout);
        alloc.dealloc(a, layout);
        let b = alloc.alloc(layout);
        assert_eq!(a, b, "freed block should come back from the prepared/dropped chain");
        alloc.dealloc(b, layout);
    }

    #[test]
    fn oversized_requests_fall_through_to_the_heap() {
        let alloc = FrameAllocator::new(FrameAllocConfig::new(64, 2, 1024));
        let layout = Layout::from_size_align(4096, 8).unwrap();
        let ptr = alloc.alloc(layout);
        assert!(!ptr.is_null());
        alloc.dealloc(ptr, layout);
    }

    #[test]
    fn disabled_allocator_always_falls_through_to_the_heap() {
        let alloc = FrameAllocator::new(FrameAllocConfig::disabled());
        let layout = Layout::from_size_align(40, 8).unwrap();
        let ptr = alloc.alloc(layout);
        assert!(!ptr.is_null());
        alloc.dealloc(ptr, layout);
    }

    #[test]
    fn coro_box_runs_drop_on_release() {
        struct CountOnDrop(Arc<AtomicUsize>);
        impl Drop for CountOnDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let count = Arc::new(AtomicUsize::new(0));
        let alloc = FrameAllocator::new(FrameAllocConfig::default());
        let boxed = CoroBox::new(CountOnDrop(count.clone()), alloc);
        drop(boxed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn box_future_polls_to_completion() {
        let alloc = default_allocator();
        let mut fut = box_future(async { 1 + 1 }, &alloc);
        let waker = crate::waker::noop();
        let mut cx = std::task::Context::from_waker(&waker);
        match fut.as_mut().poll(&mut cx) {
            std::task::Poll::Ready(v) => assert_eq!(v, 2),
            std::task::Poll::Pending => panic!("expected immediate readiness"),
        }
    }
}
