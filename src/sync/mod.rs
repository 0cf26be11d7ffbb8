pub mod fence;

use crate::error::{TtmError, TtmResult};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How often an interruptible sleeper re-checks for a raised signal.
const INTERRUPT_POLL: Duration = Duration::from_millis(5);

/// Outstanding GPU work that must retire before a buffer's memory is reused.
///
/// Taking and dropping a reference is `Arc` clone and drop.
pub trait SyncObj: Send + Sync + fmt::Debug {
    /// Has the work completed?
    fn signaled(&self) -> bool;

    /// Ask the hardware to make progress on the work.
    fn flush(&self) {}

    /// Blocks until signaled. With `intr` set, returns `Retry` once a signal
    /// is raised on the interrupt source.
    fn wait(&self, lazy: bool, intr: Option<InterruptToken<'_>>) -> TtmResult<()>;
}

pub type SyncRef = Arc<dyn SyncObj>;

/// Source of "signal pending" events for interruptible waits.
///
/// A waiter is interrupted when the generation moves past the value it
/// observed when the wait began.
#[derive(Debug, Default)]
pub struct Interrupt {
    generation: AtomicU64,
}

impl Interrupt {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// Interrupts every interruptible wait currently in progress.
    pub fn raise(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn token(&self) -> InterruptToken<'_> {
        InterruptToken {
            source: self,
            start: self.generation.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InterruptToken<'a> {
    source: &'a Interrupt,
    start: u64,
}

impl InterruptToken<'_> {
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.source.generation.load(Ordering::Acquire) != self.start
    }
}

/// A wait queue for conditions kept outside the queue itself (atomics).
///
/// State changes happen first, then [`WaitQueue::wake_all`]; sleepers test the
/// condition under the queue lock, so no wakeup is lost.
#[derive(Debug, Default)]
pub struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Sleeps until `done` returns `true`.
    ///
    /// # Errors
    /// Returns `Retry` if `intr` is given and a signal was raised meanwhile.
    pub fn wait_event(
        &self,
        intr: Option<InterruptToken<'_>>,
        mut done: impl FnMut() -> bool,
    ) -> TtmResult<()> {
        let mut guard = self.lock.lock();
        while !done() {
            match intr {
                Some(token) => {
                    if token.is_raised() {
                        return Err(TtmError::Retry);
                    }
                    self.cond.wait_for(&mut guard, INTERRUPT_POLL);
                }
                None => self.cond.wait(&mut guard),
            }
        }
        Ok(())
    }

    pub fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

pub use fence::Fence;
