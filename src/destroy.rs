use crate::bo::refs::ListRef;
use crate::bo::{BoState, BufferObject, PrivFlags};
use crate::device::BoDevice;
use crate::error::{TtmError, TtmResult};
use crate::memory::RangeAllocator;
use crate::placement::{PlacementFlags, mem_type};
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Poll step while waiting out a sync object at teardown.
const EXPIRE_POLL: Duration = Duration::from_millis(1);

impl BoDevice {
    /// The last strong reference is gone.
    pub(crate) fn release_bo(&self, bo: &Arc<BufferObject>) {
        trace!(bo = %bo.id(), "Releasing buffer object");
        self.cleanup_refs(bo, false);
        self.list_put(bo);
    }

    /// Frees the buffer's memory if its GPU work has retired. Otherwise
    /// queues it for delayed destruction.
    ///
    /// With `remove_all`, outstanding work is waited out (or abandoned after
    /// a lockup) and the buffer is always freed.
    pub(crate) fn cleanup_refs(&self, bo: &Arc<BufferObject>, remove_all: bool) {
        let mut st = bo.state.lock();
        if st.sync_obj.as_ref().is_some_and(|sync| sync.signaled()) {
            st.sync_obj = None;
            st.priv_flags.remove(PrivFlags::MOVING);
        }
        if st.sync_obj.is_some() && remove_all {
            if let Err(e) = self.expire_sync_obj(&mut st, false) {
                error!(bo = %bo.id(), error = %e, "Failed to expire sync object");
            }
        }

        if st.sync_obj.is_none() {
            if let Some(ttm) = st.ttm.as_mut() {
                ttm.unbind();
            }
            let node = st.mem.node.take();
            let old_type = st.mem.mem_type;
            st.mem.mem_type = mem_type::SYSTEM;
            st.mem.flags = PlacementFlags::SYSTEM | PlacementFlags::CACHED;
            st.offset = 0;

            let (on_ddestroy, put_count) = {
                let mut lru = self.lru.lock();
                if let Some(node) = node {
                    let man = &mut lru.man[old_type as usize];
                    if let Some(io) = man.io_mem() {
                        io.discard(node);
                    }
                    man.manager.free(node);
                }
                let on_ddestroy = lru.ddestroy.remove(bo.id());
                (on_ddestroy, lru.del_from_lru(bo.id()))
            };
            drop(st);

            if on_ddestroy {
                bo.list_put_nonfinal(1);
            }
            for _ in 0..put_count {
                self.list_put(bo);
            }
            debug!(bo = %bo.id(), "Destroyed buffer object");
            return;
        }

        let sync = st.sync_obj.clone();
        let queued = self.lru.lock().ddestroy.contains(bo.id());
        if !queued {
            if let Some(sync) = sync {
                sync.flush();
            }
            let mut lru = self.lru.lock();
            if lru.ddestroy.push_back(bo.id()) {
                bo.list_get();
            }
            drop(lru);
            drop(st);
            trace!(bo = %bo.id(), "Queued busy buffer for delayed destruction");
            self.schedule_delayed_delete();
        }
    }

    /// One pass over the delayed-destroy list. Returns `true` if buffers are
    /// still waiting afterwards.
    pub fn delayed_delete(&self, remove_all: bool) -> bool {
        let entries: Vec<ListRef<'_>> = {
            let lru = self.lru.lock();
            lru.ddestroy
                .iter()
                .filter_map(|id| lru.objects.get(&id))
                .map(|bo| ListRef::new(self, bo))
                .collect()
        };
        for entry in entries {
            self.cleanup_refs(entry.bo(), remove_all);
        }
        !self.lru.lock().ddestroy.is_empty()
    }

    pub(crate) fn delayed_workqueue(&self) {
        if self.delayed_delete(false) {
            self.schedule_delayed_delete();
        }
    }

    pub(crate) fn schedule_delayed_delete(&self) {
        self.ddestroy_work.schedule(self.config().delayed_delete_period);
    }

    /// Waits out the buffer's sync object for teardown, then drops it.
    ///
    /// In nice mode the wait is bounded by the nice-mode timeout; a sync
    /// object that never signals is taken as a GPU lockup and nice mode is
    /// switched off for the rest of the device's life.
    pub(crate) fn expire_sync_obj(
        &self,
        st: &mut MutexGuard<'_, BoState>,
        allow_errors: bool,
    ) -> TtmResult<()> {
        if st.sync_obj.is_none() {
            return Ok(());
        }

        if self.nice_mode() {
            let deadline = Instant::now() + self.config().nice_mode_timeout;
            loop {
                match self.bo_wait(st, false, None, true) {
                    Ok(()) => break,
                    Err(TtmError::Busy) if Instant::now() < deadline => {
                        MutexGuard::unlocked(st, || thread::sleep(EXPIRE_POLL));
                    }
                    Err(TtmError::Busy) => break,
                    Err(e) if allow_errors => return Err(e),
                    Err(_) => break,
                }
            }
            if st.sync_obj.is_some() {
                self.nice_mode.store(false, Ordering::Release);
                error!("Detected probable GPU lockup. Evicting buffer.");
            }
        }

        if st.sync_obj.take().is_some() {
            st.priv_flags.remove(PrivFlags::MOVING);
        }
        Ok(())
    }
}
