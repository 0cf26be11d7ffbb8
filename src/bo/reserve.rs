use super::{BoRef, BufferObject};
use crate::device::{BoDevice, LruState};
use crate::error::{TtmError, TtmResult};
use crate::placement::PlacementFlags;
use crate::sync::{InterruptToken, SyncRef};
use crate::utils::seq_must_back_off;
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::trace;

/// The exclusive "I am changing this buffer's placement" right.
///
/// `seq_valid` and `val_seq` are only touched under the LRU lock.
#[derive(Debug, Default)]
pub(crate) struct Reservation {
    reserved: AtomicBool,
    seq_valid: AtomicBool,
    val_seq: AtomicU32,
}

impl Reservation {
    pub(crate) const fn new_reserved() -> Self {
        Self {
            reserved: AtomicBool::new(true),
            seq_valid: AtomicBool::new(false),
            val_seq: AtomicU32::new(0),
        }
    }

    fn try_lock(&self) -> bool {
        self.reserved
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self) {
        self.reserved.store(false, Ordering::Release);
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.reserved.load(Ordering::Acquire)
    }
}

impl BufferObject {
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.reservation.is_locked()
    }

    /// Reserves with the LRU lock held. The lock is dropped while sleeping
    /// and retaken before returning.
    pub(crate) fn reserve_locked(
        &self,
        lru: &mut MutexGuard<'_, LruState>,
        intr: Option<InterruptToken<'_>>,
        no_wait: bool,
        sequence: Option<u32>,
    ) -> TtmResult<()> {
        while !self.reservation.try_lock() {
            if let Some(seq) = sequence {
                let holder = self.reservation.val_seq.load(Ordering::Relaxed);
                if self.reservation.seq_valid.load(Ordering::Relaxed)
                    && seq_must_back_off(seq, holder)
                {
                    trace!(bo = %self.id, seq, holder, "Backing off ordered reservation");
                    return Err(TtmError::Retry);
                }
            }
            if no_wait {
                return Err(TtmError::Busy);
            }
            MutexGuard::unlocked(lru, || self.wait_unreserved(intr))?;
        }

        match sequence {
            Some(seq) => {
                self.reservation.val_seq.store(seq, Ordering::Relaxed);
                self.reservation.seq_valid.store(true, Ordering::Relaxed);
            }
            None => self.reservation.seq_valid.store(false, Ordering::Relaxed),
        }
        Ok(())
    }

    pub(crate) fn wait_unreserved(&self, intr: Option<InterruptToken<'_>>) -> TtmResult<()> {
        self.event_queue.wait_event(intr, || !self.is_reserved())
    }

    /// Takes the reservation without touching the LRU lists.
    ///
    /// # Errors
    /// `Retry` if interrupted.
    pub(crate) fn block_reservation(&self, intr: Option<InterruptToken<'_>>) -> TtmResult<()> {
        while !self.reservation.try_lock() {
            self.wait_unreserved(intr)?;
        }
        Ok(())
    }

    /// Releases a reservation taken with [`Self::block_reservation`], leaving
    /// the buffer off every LRU list.
    pub(crate) fn unblock_reservation(&self) {
        self.reservation.release();
        self.event_queue.wake_all();
    }
}

impl BoDevice {
    pub(crate) fn reserve_bo(
        &self,
        bo: &Arc<BufferObject>,
        interruptible: bool,
        no_wait: bool,
        sequence: Option<u32>,
    ) -> TtmResult<()> {
        let intr = self.interrupt_token(interruptible);
        let mut lru = self.lru.lock();
        bo.reserve_locked(&mut lru, intr, no_wait, sequence)?;
        let put_count = lru.del_from_lru(bo.id());
        drop(lru);
        bo.list_put_nonfinal(put_count);
        Ok(())
    }

    /// Puts the buffer back on the LRU lists of its placement and wakes
    /// waiters.
    pub(crate) fn unreserve_bo(&self, bo: &BufferObject) {
        let entry = bo.lru_entry();
        let mut lru = self.lru.lock();
        lru.add_to_lru(bo, entry);
        bo.reservation.release();
        drop(lru);
        bo.event_queue.wake_all();
    }
}

/// Proof of a held reservation. Unreserves on drop.
pub struct Reserved<'a> {
    bo: &'a BoRef,
}

impl<'a> Reserved<'a> {
    /// Wraps a reservation the caller already holds.
    pub(crate) const fn adopt(bo: &'a BoRef) -> Self {
        Self { bo }
    }

    pub(crate) fn bo(&self) -> &Arc<BufferObject> {
        self.bo.object()
    }

    fn dev(&self) -> &BoDevice {
        self.bo.device()
    }

    /// Moves the buffer, if needed, so its placement satisfies `proposed`.
    ///
    /// # Errors
    /// `InvalidArgument` when no memory type matches, `OutOfMemory` when
    /// nothing can be evicted, `Busy`/`Retry` for pending work or signals.
    pub fn validate(
        &self,
        proposed: PlacementFlags,
        interruptible: bool,
        no_wait: bool,
    ) -> TtmResult<()> {
        self.dev().validate_bo(self.bo(), proposed, interruptible, no_wait)
    }

    /// Attaches the sync object of freshly submitted GPU work.
    pub fn set_sync_obj(&self, sync: SyncRef) {
        self.bo().state.lock().sync_obj = Some(sync);
    }

    /// Waits for the buffer's GPU work to retire.
    ///
    /// # Errors
    /// `Busy` when `no_wait` is set and work is pending, `Retry` if interrupted.
    pub fn wait(&self, lazy: bool, interruptible: bool, no_wait: bool) -> TtmResult<()> {
        self.bo.wait(lazy, interruptible, no_wait)
    }

    /// Copies buffer contents at `offset` into `dst`.
    ///
    /// # Errors
    /// `InvalidArgument` for out-of-range access, or swap-in failures.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> TtmResult<()> {
        self.dev().cpu_read(self.bo(), offset, dst)
    }

    /// Copies `src` into the buffer at `offset`.
    ///
    /// # Errors
    /// `InvalidArgument` for out-of-range access, or swap-in failures.
    pub fn write(&self, offset: usize, src: &[u8]) -> TtmResult<()> {
        self.dev().cpu_write(self.bo(), offset, src)
    }

    pub fn unreserve(self) {}
}

impl Drop for Reserved<'_> {
    fn drop(&mut self) {
        self.bo.device().unreserve_bo(self.bo.object());
    }
}

impl std::fmt::Debug for Reserved<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Reserved").field(&self.bo.id()).finish()
    }
}
