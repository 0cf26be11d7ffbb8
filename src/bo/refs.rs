use super::{BufferObject, Reserved};
use crate::device::BoDevice;
use crate::error::{TtmError, TtmResult};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::debug;

impl BufferObject {
    /// Takes a list reference on behalf of a list membership.
    pub(crate) fn list_get(&self) {
        self.list_kref.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops `count` list references that can never be the last ones, because
    /// the caller still holds a reference of its own.
    pub(crate) fn list_put_nonfinal(&self, count: usize) {
        if count == 0 {
            return;
        }
        let prev = self.list_kref.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(prev > count, "{}: list reference dropped to zero while in use", self.id);
    }
}

/// A temporary list reference held while a buffer is worked on outside the
/// LRU lock.
///
/// Never drop one while holding the LRU lock: the last reference frees the
/// object, which takes that lock.
pub(crate) struct ListRef<'d> {
    dev: &'d BoDevice,
    bo: Arc<BufferObject>,
}

impl<'d> ListRef<'d> {
    pub(crate) fn new(dev: &'d BoDevice, bo: &Arc<BufferObject>) -> Self {
        bo.list_get();
        Self { dev, bo: bo.clone() }
    }

    pub(crate) const fn bo(&self) -> &Arc<BufferObject> {
        &self.bo
    }
}

impl Drop for ListRef<'_> {
    fn drop(&mut self) {
        self.dev.list_put(&self.bo);
    }
}

impl BoDevice {
    /// Drops one list reference, freeing the object on the last one.
    pub(crate) fn list_put(&self, bo: &Arc<BufferObject>) {
        if bo.list_kref.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.release_list(bo);
        }
    }

    fn release_list(&self, bo: &Arc<BufferObject>) {
        debug_assert_eq!(bo.strong_count(), 0);
        debug_assert_eq!(bo.cpu_writers(), 0);
        {
            let mut st = bo.state.lock();
            debug_assert!(st.sync_obj.is_none());
            debug_assert!(st.mem.node.is_none());
            st.ttm = None;
        }
        self.remove_object(bo.id());
        self.mem_glob().free(bo.acc_size());
        debug!(bo = %bo.id(), "Freed buffer object");
    }
}

/// A strong, user-level reference to a buffer object.
///
/// Cloning takes another reference; dropping the last one destroys the buffer
/// once its outstanding GPU work has retired.
pub struct BoRef {
    dev: Arc<BoDevice>,
    bo: Arc<BufferObject>,
}

impl BoRef {
    /// Wraps an object whose strong count already includes this reference.
    pub(crate) const fn from_counted(dev: Arc<BoDevice>, bo: Arc<BufferObject>) -> Self {
        Self { dev, bo }
    }

    #[must_use]
    pub const fn device(&self) -> &Arc<BoDevice> {
        &self.dev
    }

    pub(crate) const fn object(&self) -> &Arc<BufferObject> {
        &self.bo
    }

    /// Reserves the buffer for placement changes.
    ///
    /// With `sequence` set, the reservation takes part in ordered
    /// multi-buffer reservation and may fail with `Retry` instead of
    /// waiting.
    ///
    /// # Errors
    /// `Busy` when `no_wait` is set and the buffer is reserved, `Retry` on
    /// an ordering back-off or a raised signal.
    pub fn reserve(
        &self,
        interruptible: bool,
        no_wait: bool,
        sequence: Option<u32>,
    ) -> TtmResult<Reserved<'_>> {
        self.dev.reserve_bo(&self.bo, interruptible, no_wait, sequence)?;
        Ok(Reserved::adopt(self))
    }

    /// Sleeps until nobody holds the reservation.
    ///
    /// # Errors
    /// `Retry` if interrupted.
    pub fn wait_unreserved(&self, interruptible: bool) -> TtmResult<()> {
        let intr = self.dev.interrupt_token(interruptible);
        self.bo.wait_unreserved(intr)
    }

    /// Takes the reservation without unlinking the buffer from the LRU
    /// lists. Pair with [`Self::unblock_reservation`].
    ///
    /// # Errors
    /// `Retry` if interrupted.
    pub fn block_reservation(&self, interruptible: bool) -> TtmResult<()> {
        let intr = self.dev.interrupt_token(interruptible);
        self.bo.block_reservation(intr)
    }

    pub fn unblock_reservation(&self) {
        self.bo.unblock_reservation();
    }

    /// Waits for the buffer's GPU work to retire.
    ///
    /// # Errors
    /// `Busy` when `no_wait` is set and work is pending, `Retry` if interrupted.
    pub fn wait(&self, lazy: bool, interruptible: bool, no_wait: bool) -> TtmResult<()> {
        let intr = self.dev.interrupt_token(interruptible);
        let mut st = self.bo.state.lock();
        self.dev.bo_wait(&mut st, lazy, intr, no_wait)
    }

    /// Whether GPU work on the buffer is still pending. Flushes it if so.
    #[must_use]
    pub fn busy(&self) -> bool {
        let mut st = self.bo.state.lock();
        self.dev.bo_busy(&mut st)
    }

    /// Registers a CPU writer after the GPU is done with the buffer.
    ///
    /// # Errors
    /// `Busy` when `no_wait` is set and the buffer is reserved or in use.
    pub fn synccpu_write_grab(&self, no_wait: bool) -> TtmResult<()> {
        let reserved = self.reserve(true, no_wait, None)?;
        let intr = self.dev.interrupt_token(true);
        let mut st = self.bo.state.lock();
        self.dev.bo_wait(&mut st, false, intr, no_wait)?;
        self.bo.cpu_writer_grabbed();
        drop(st);
        reserved.unreserve();
        Ok(())
    }

    /// Sleeps until no CPU writer holds the buffer.
    ///
    /// # Errors
    /// `Busy` when `no_wait` is set and writers remain, `Retry` if interrupted.
    pub fn wait_cpu(&self, no_wait: bool) -> TtmResult<()> {
        if no_wait {
            return if self.bo.cpu_writers() == 0 {
                Ok(())
            } else {
                Err(TtmError::Busy)
            };
        }
        let intr = self.dev.interrupt_token(true);
        self.bo.event_queue.wait_event(intr, || self.bo.cpu_writers() == 0)
    }
}

impl Deref for BoRef {
    type Target = BufferObject;

    fn deref(&self) -> &BufferObject {
        &self.bo
    }
}

impl Clone for BoRef {
    fn clone(&self) -> Self {
        self.bo.kref.fetch_add(1, Ordering::Relaxed);
        Self {
            dev: self.dev.clone(),
            bo: self.bo.clone(),
        }
    }
}

impl Drop for BoRef {
    fn drop(&mut self) {
        // The address-space lock covers the final decrement so a concurrent
        // offset lookup cannot revive the object.
        let mut vm = self.dev.vm_write();
        if self.bo.kref.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        vm.remove(self.bo.id());
        drop(vm);
        self.dev.release_bo(&self.bo);
    }
}

impl std::fmt::Debug for BoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BoRef").field(&self.bo.id()).finish()
    }
}
