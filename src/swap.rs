use crate::bo::refs::ListRef;
use crate::bo::BufferObject;
use crate::device::BoDevice;
use crate::error::{TtmError, TtmResult};
use crate::placement::{MemReg, PlacementFlags, mem_type};
use std::sync::Arc;
use tracing::{debug, warn};

impl BoDevice {
    /// Swaps out the least recently used buffer that has backing pages.
    ///
    /// # Errors
    /// `Busy` when the swap LRU is empty, otherwise the move or I/O error.
    pub fn swapout(&self) -> TtmResult<()> {
        let (bo, entry) = loop {
            let mut lru = self.lru.lock();
            let Some(bo) = lru.swap_lru.front().and_then(|id| lru.objects.get(&id).cloned()) else {
                return Err(TtmError::Busy);
            };
            let entry = ListRef::new(self, &bo);

            if bo.reserve_locked(&mut lru, None, true, None).is_ok() {
                let put_count = lru.del_from_lru(bo.id());
                drop(lru);
                bo.list_put_nonfinal(put_count);
                break (bo, entry);
            }

            drop(lru);
            bo.wait_unreserved(None)?;
            drop(entry);
        };

        let ret = self.swapout_reserved(&bo);
        if let Err(e) = &ret {
            warn!(bo = %bo.id(), error = %e, "Swap out failed");
        }

        // Swapped buffers stay off the LRU lists until reserved again.
        bo.unblock_reservation();
        drop(entry);
        ret
    }

    fn swapout_reserved(&self, bo: &Arc<BufferObject>) -> TtmResult<()> {
        let mut st = bo.state.lock();
        self.bo_wait(&mut st, false, None, false)?;

        let swap_placement = PlacementFlags::SYSTEM | PlacementFlags::CACHED;
        if (st.mem.flags & swap_placement) != swap_placement {
            let mut evict_mem = MemReg {
                mem_type: mem_type::SYSTEM,
                node: None,
                flags: swap_placement,
                proposed_flags: swap_placement,
                ..st.mem.clone()
            };
            self.handle_move_mem(bo, &mut st, &mut evict_mem, true, None, false)?;
        }

        self.unmap_virtual(bo);

        match st.ttm.as_mut() {
            Some(ttm) => ttm.swap_out(bo.persistent_swap_storage())?,
            None => return Ok(()),
        }
        debug!(bo = %bo.id(), pages = bo.num_pages(), "Swapped out buffer");
        Ok(())
    }

    /// Swaps out buffers until nothing is left to swap.
    pub fn swapout_all(&self) {
        while self.swapout().is_ok() {}
    }

    pub(crate) fn swap_workqueue(&self) {
        while self.mem_glob().swap_needed() {
            if self.swapout().is_err() {
                break;
            }
        }
        self.swap_work.schedule(self.config().swap_poll_period);
    }
}
