use super::refs::ListRef;
use super::{BoState, BoType, BufferObject, PrivFlags};
use crate::device::BoDevice;
use crate::error::{TtmError, TtmResult};
use crate::memory::RangeAllocator;
use crate::placement::{MemReg, PlacementFlags, mem_type};
use crate::sync::InterruptToken;
use parking_lot::MutexGuard;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, trace};

type StateGuard<'a> = MutexGuard<'a, BoState>;

impl BoDevice {
    /// Waits for the buffer's sync object, dropping it once signaled.
    ///
    /// The buffer mutex is released while sleeping.
    pub(crate) fn bo_wait(
        &self,
        st: &mut StateGuard<'_>,
        lazy: bool,
        intr: Option<InterruptToken<'_>>,
        no_wait: bool,
    ) -> TtmResult<()> {
        while let Some(sync) = st.sync_obj.clone() {
            if sync.signaled() {
                st.sync_obj = None;
                st.priv_flags.remove(PrivFlags::MOVING);
                break;
            }
            if no_wait {
                return Err(TtmError::Busy);
            }
            MutexGuard::unlocked(st, || sync.wait(lazy, intr))?;
            if st.sync_obj.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, &sync)) {
                st.sync_obj = None;
                st.priv_flags.remove(PrivFlags::MOVING);
            }
        }
        Ok(())
    }

    /// Returns `true` while GPU work is pending, flushing it.
    pub(crate) fn bo_busy(&self, st: &mut StateGuard<'_>) -> bool {
        let Some(sync) = st.sync_obj.clone() else {
            return false;
        };
        if sync.signaled() {
            st.sync_obj = None;
            st.priv_flags.remove(PrivFlags::MOVING);
            return false;
        }
        sync.flush();
        true
    }

    /// Evicts a reserved buffer out of `mem_type`.
    pub(crate) fn evict(
        &self,
        bo: &BufferObject,
        st: &mut StateGuard<'_>,
        mem_type: u32,
        intr: Option<InterruptToken<'_>>,
        no_wait: bool,
    ) -> TtmResult<()> {
        if st.mem.mem_type != mem_type {
            return Ok(());
        }

        if let Err(e) = self.bo_wait(st, false, intr, no_wait) {
            if !e.is_retry() {
                error!(bo = %bo.id(), "Failed to expire sync object before buffer eviction");
            }
            return Err(e);
        }
        debug_assert!(bo.is_reserved());

        let mut evict_mem = st.mem.clone();
        evict_mem.node = None;
        evict_mem.proposed_flags = self.driver().evict_flags(bo, &st.mem);
        debug_assert!(
            !evict_mem.proposed_flags.intersects(PlacementFlags::for_mem_type(mem_type)),
            "eviction must leave the memory type"
        );

        let mut placed = self.mem_space(bo, &mut evict_mem, intr, no_wait);
        if matches!(&placed, Err(e) if !e.is_retry()) {
            evict_mem.proposed_flags = PlacementFlags::SYSTEM | PlacementFlags::CACHED;
            placed = self.mem_space(bo, &mut evict_mem, intr, no_wait);
        }
        if let Err(e) = placed {
            if !e.is_retry() {
                error!(bo = %bo.id(), "Failed to find memory space for buffer eviction");
            }
            return Err(e);
        }

        if let Err(e) = self.handle_move_mem(bo, st, &mut evict_mem, true, intr, no_wait) {
            if !e.is_retry() {
                error!(bo = %bo.id(), error = %e, "Buffer eviction failed");
            }
            if let Some(node) = evict_mem.node.take() {
                self.free_node(evict_mem.mem_type, node);
            }
            return Err(e);
        }

        st.priv_flags.insert(PrivFlags::EVICTED);
        debug!(bo = %bo.id(), from = mem_type, to = st.mem.mem_type, "Evicted buffer");
        Ok(())
    }

    /// Frees enough of `mem_type` for `mem` by evicting its LRU buffers.
    ///
    /// Buffers that cannot be reserved right away are skipped.
    fn force_space(
        &self,
        mem: &mut MemReg,
        mem_type: u32,
        intr: Option<InterruptToken<'_>>,
        no_wait: bool,
    ) -> TtmResult<()> {
        let idx = mem_type as usize;
        let mut skipped = HashSet::new();

        let mut lru = self.lru.lock();
        loop {
            if let Some(node) = lru.man[idx].find_space(mem.num_pages, mem.page_alignment) {
                mem.node = Some(node);
                mem.mem_type = mem_type;
                return Ok(());
            }

            let Some(victim) = lru.man[idx]
                .lru
                .iter()
                .find(|id| !skipped.contains(id))
                .and_then(|id| lru.objects.get(&id).cloned())
            else {
                return Err(TtmError::OutOfMemory);
            };
            let entry = ListRef::new(self, &victim);

            if victim.reserve_locked(&mut lru, None, true, None).is_err() {
                skipped.insert(victim.id());
                MutexGuard::unlocked(&mut lru, || drop(entry));
                continue;
            }
            let put_count = lru.del_from_lru(victim.id());
            drop(lru);
            victim.list_put_nonfinal(put_count);

            trace!(bo = %victim.id(), mem_type, "Evicting to make space");
            let ret = {
                let mut vst = victim.state.lock();
                self.evict(&victim, &mut vst, mem_type, intr, no_wait)
            };
            self.unreserve_bo(&victim);
            drop(entry);
            ret?;

            lru = self.lru.lock();
        }
    }

    /// Picks a memory type and range for `mem` according to its proposed
    /// flags and the driver's priorities, evicting when everything is full.
    pub(crate) fn mem_space(
        &self,
        bo: &BufferObject,
        mem: &mut MemReg,
        intr: Option<InterruptToken<'_>>,
        no_wait: bool,
    ) -> TtmResult<()> {
        let disallow_fixed = bo.bo_type() == BoType::User;
        let prio = self.driver().mem_type_prio();
        let busy_prio = self.driver().mem_busy_prio();
        mem.node = None;

        let mut type_found = false;
        {
            let mut lru = self.lru.lock();
            for &mt in prio {
                let Some(man) = lru.man.get_mut(mt as usize) else {
                    continue;
                };
                let Some(cur_flags) = man.compatible_flags(disallow_fixed, mem.proposed_flags)
                else {
                    continue;
                };

                if mt == mem_type::SYSTEM {
                    mem.mem_type = mt;
                    mem.flags = cur_flags;
                    return Ok(());
                }
                if man.has_type && man.use_type {
                    type_found = true;
                    if let Some(node) = man.find_space(mem.num_pages, mem.page_alignment) {
                        mem.mem_type = mt;
                        mem.node = Some(node);
                        mem.flags = cur_flags;
                        return Ok(());
                    }
                }
            }
        }

        if !type_found {
            return Err(TtmError::InvalidArgument(format!(
                "no usable memory type for {:?}",
                mem.proposed_flags
            )));
        }

        let mut has_eagain = false;
        for &mt in busy_prio {
            let cur_flags = {
                let lru = self.lru.lock();
                match lru.man.get(mt as usize) {
                    Some(man) if man.has_type => {
                        man.compatible_flags(disallow_fixed, mem.proposed_flags)
                    }
                    _ => None,
                }
            };
            let Some(cur_flags) = cur_flags else {
                continue;
            };

            match self.force_space(mem, mt, intr, no_wait) {
                Ok(()) => {
                    mem.flags = cur_flags;
                    return Ok(());
                }
                Err(e) if e.is_transient() => has_eagain = true,
                Err(_) => {}
            }
        }

        Err(if has_eagain {
            TtmError::Retry
        } else {
            TtmError::OutOfMemory
        })
    }

    fn move_buffer(
        &self,
        bo: &BufferObject,
        st: &mut StateGuard<'_>,
        new_flags: PlacementFlags,
        intr: Option<InterruptToken<'_>>,
        no_wait: bool,
    ) -> TtmResult<()> {
        // Nudge pending work along, then make sure it has retired: the
        // memory moves below must not race the GPU.
        self.bo_busy(st);
        self.bo_wait(st, false, intr, no_wait)?;

        let mut mem = MemReg::request(bo.num_pages(), st.mem.page_alignment, new_flags);
        self.mem_space(bo, &mut mem, intr, no_wait)?;

        let ret = self.handle_move_mem(bo, st, &mut mem, false, intr, no_wait);
        if ret.is_err() {
            if let Some(node) = mem.node.take() {
                self.free_node(mem.mem_type, node);
            }
        }
        ret
    }

    /// Makes a reserved buffer's placement match `proposed`.
    pub(crate) fn validate_bo(
        &self,
        bo: &BufferObject,
        proposed: PlacementFlags,
        interruptible: bool,
        no_wait: bool,
    ) -> TtmResult<()> {
        debug_assert!(bo.is_reserved());
        let intr = self.interrupt_token(interruptible);
        let mut st = bo.state.lock();
        st.proposed_flags = proposed;
        st.mem.proposed_flags = proposed;

        trace!(bo = %bo.id(), ?proposed, current = ?st.mem.flags, "Validating buffer");

        if !st.mem.is_compatible() {
            if let Err(e) = self.move_buffer(bo, &mut st, proposed, intr, no_wait) {
                if !e.is_retry() {
                    error!(bo = %bo.id(), ?proposed, error = %e, "Failed moving buffer");
                    if matches!(e, TtmError::OutOfMemory) {
                        error!("Out of aperture space or memory quota");
                    }
                }
                return Err(e);
            }
        }

        // Buffers in system memory keep a page array around.
        if st.mem.mem_type == mem_type::SYSTEM && st.ttm.is_none() {
            st.ttm = Some(self.add_ttm(bo));
        }

        st.mem.flags = st.mem.flags.masked(proposed, !PlacementFlags::MASK_MEMTYPE);
        Ok(())
    }

    pub(crate) fn free_node(&self, mem_type: u32, node: crate::memory::Extent) {
        let mut lru = self.lru.lock();
        let man = &mut lru.man[mem_type as usize];
        if let Some(io) = man.io_mem() {
            io.discard(node);
        }
        man.manager.free(node);
    }
}
