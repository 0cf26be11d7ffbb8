use super::{InterruptToken, SyncObj, WaitQueue};
use crate::error::TtmResult;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

struct WaitGuard<'a>(&'a Fence);
impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A CPU-signaled fence.
///
/// This is the sync object used when the GPU completion is reported from
/// software (an interrupt handler, a completion thread, or a test).
#[derive(Debug, Default)]
pub struct Fence {
    signaled: AtomicBool,

    /// Number of `flush` requests seen while pending.
    flushes: AtomicUsize,

    /// Tracks how many threads are currently sleeping on this fence.
    waiting: AtomicU32,

    queue: WaitQueue,
}

impl Fence {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A fence whose work has already retired.
    #[must_use]
    pub fn new_signaled() -> Arc<Self> {
        let fence = Self::default();
        fence.signaled.store(true, Ordering::Relaxed);
        Arc::new(fence)
    }

    /// Marks the work complete and wakes every waiter.
    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
        self.queue.wake_all();
    }

    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn waiters(&self) -> u32 {
        self.waiting.load(Ordering::Relaxed)
    }
}

impl SyncObj for Fence {
    fn signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    fn flush(&self) {
        if !self.signaled() {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn wait(&self, _lazy: bool, intr: Option<InterruptToken<'_>>) -> TtmResult<()> {
        self.waiting.fetch_add(1, Ordering::Relaxed);
        let _guard = WaitGuard(self);
        self.queue.wait_event(intr, || self.signaled())
    }
}
