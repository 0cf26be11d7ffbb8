use crate::error::{TtmError, TtmResult};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Global memory accounting service the buffer manager charges object
/// bookkeeping against.
pub trait MemAccounting: Send + Sync + fmt::Debug {
    /// Charge `size` bytes. Fails with `OutOfMemory` when over budget.
    fn alloc(&self, size: usize, no_wait: bool) -> TtmResult<()>;

    /// Return `size` bytes previously charged.
    fn free(&self, size: usize);

    /// Whether usage is above the level where buffers should be swapped out.
    fn swap_needed(&self) -> bool {
        false
    }
}

/// A byte budget with a hard limit and a softer swap threshold.
#[derive(Debug)]
pub struct MemGlobal {
    max_bytes: usize,
    swap_limit: usize,
    used: AtomicUsize,
}

impl MemGlobal {
    #[must_use]
    pub const fn new(max_bytes: usize, swap_limit: usize) -> Self {
        Self {
            max_bytes,
            swap_limit,
            used: AtomicUsize::new(0),
        }
    }

    /// A budget that never refuses and never asks for swap.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self::new(usize::MAX, usize::MAX)
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl MemAccounting for MemGlobal {
    fn alloc(&self, size: usize, _no_wait: bool) -> TtmResult<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&new| new <= self.max_bytes)
            })
            .map(|_| ())
            .map_err(|_| TtmError::OutOfMemory)
    }

    fn free(&self, size: usize) {
        let prev = self.used.fetch_sub(size, Ordering::AcqRel);
        debug_assert!(prev >= size, "accounting underflow");
    }

    fn swap_needed(&self) -> bool {
        self.used() > self.swap_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_hard_limit() {
        let glob = MemGlobal::new(100, 50);
        glob.alloc(60, false).unwrap();
        assert!(glob.swap_needed());
        assert!(matches!(glob.alloc(41, false), Err(TtmError::OutOfMemory)));
        glob.alloc(40, false).unwrap();
        assert_eq!(glob.used(), 100);
        glob.free(100);
        assert_eq!(glob.used(), 0);
        assert!(!glob.swap_needed());
    }

    #[test]
    fn unlimited_never_refuses() {
        let glob = MemGlobal::unlimited();
        glob.alloc(usize::MAX / 2, true).unwrap();
        assert!(!glob.swap_needed());
    }
}
