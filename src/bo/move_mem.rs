#![allow(clippy::cast_possible_truncation)]

use super::{BoState, BoType, BufferObject, PrivFlags, page_bytes};
use crate::device::BoDevice;
use crate::error::{TtmError, TtmResult};
use crate::memory::IoMemory;
use crate::placement::{MemReg, PlacementFlags, mem_type};
use crate::sync::InterruptToken;
use crate::tt::Tt;
use crate::utils::{PAGE_SIZE, pages_to_bytes};
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{error, trace};

type StateGuard<'a> = MutexGuard<'a, BoState>;

impl BoDevice {
    /// A fresh, unpopulated page array for `bo`.
    pub(crate) fn add_ttm(&self, bo: &BufferObject) -> Tt {
        Tt::new(bo.num_pages(), bo.bo_type() == BoType::User)
            .with_accounting(self.mem_glob().clone())
    }

    /// Kills CPU mappings of the buffer in the device address space.
    pub(crate) fn unmap_virtual(&self, bo: &BufferObject) {
        let offset = bo.addr_space_offset();
        if offset == 0 {
            return;
        }
        if let Some(mapping) = self.dev_mapping() {
            mapping.unmap_range(offset, page_bytes(bo.num_pages()));
        }
    }

    /// Moves a reserved buffer's contents and placement to `mem`.
    ///
    /// On success the range in `mem` belongs to the buffer and `mem.node` is
    /// cleared. On failure it is left for the caller to free.
    pub(crate) fn handle_move_mem(
        &self,
        bo: &BufferObject,
        st: &mut StateGuard<'_>,
        mem: &mut MemReg,
        evict: bool,
        intr: Option<InterruptToken<'_>>,
        no_wait: bool,
    ) -> TtmResult<()> {
        let (old_pci, new_pci, old_fixed) = {
            let lru = self.lru.lock();
            let old_man = &lru.man[st.mem.mem_type as usize];
            let new_man = &lru.man[mem.mem_type as usize];
            (old_man.reg_is_pci(&st.mem), new_man.reg_is_pci(mem), old_man.is_fixed())
        };

        let same_caching = (mem.flags & st.mem.flags).intersects(PlacementFlags::MASK_CACHING);
        if old_pci || new_pci || !same_caching {
            self.unmap_virtual(bo);
        }

        if let Err(e) = self.move_placement(bo, st, mem, evict, intr, no_wait) {
            if old_fixed {
                st.ttm = None;
            }
            return Err(e);
        }

        if st.priv_flags.contains(PrivFlags::EVICTED) {
            if let Err(e) = self.driver().invalidate_caches(st.mem.flags) {
                error!(bo = %bo.id(), error = %e, "Can not flush read caches");
            }
        }
        st.priv_flags.set(PrivFlags::EVICTED, evict);

        let gpu_offset = self.lru.lock().man[st.mem.mem_type as usize].gpu_offset();
        st.offset = st.mem.node.map_or(0, |node| page_bytes(node.start) + gpu_offset);
        trace!(bo = %bo.id(), mem_type = st.mem.mem_type, offset = st.offset, "Moved buffer");
        Ok(())
    }

    fn move_placement(
        &self,
        bo: &BufferObject,
        st: &mut StateGuard<'_>,
        mem: &mut MemReg,
        evict: bool,
        intr: Option<InterruptToken<'_>>,
        no_wait: bool,
    ) -> TtmResult<()> {
        let (old_fixed, new_fixed) = {
            let lru = self.lru.lock();
            (
                lru.man[st.mem.mem_type as usize].is_fixed(),
                lru.man[mem.mem_type as usize].is_fixed(),
            )
        };

        if !new_fixed && st.ttm.is_none() {
            let mut ttm = self.add_ttm(bo);
            ttm.set_placement_caching(mem.flags);
            if mem.mem_type != mem_type::SYSTEM {
                ttm.bind(mem.mem_type)?;
            }
            st.ttm = Some(ttm);

            if st.mem.mem_type == mem_type::SYSTEM {
                // Nothing to copy yet.
                self.adopt_placement(st, mem);
                return Ok(());
            }
        }

        if !old_fixed && !new_fixed {
            self.move_ttm(st, mem)
        } else if let Some(mover) = self.driver().mover() {
            mover.move_bo(bo, evict, intr.is_some(), no_wait, &st.mem, mem)?;
            self.finish_fixed_move(st, mem, new_fixed);
            Ok(())
        } else {
            self.move_memcpy(bo, st, mem, new_fixed)
        }
    }

    /// Rebinds the page array: both placements are system pages.
    fn move_ttm(&self, st: &mut StateGuard<'_>, mem: &mut MemReg) -> TtmResult<()> {
        let old_type = st.mem.mem_type;
        let Some(ttm) = st.ttm.as_mut() else {
            return Err(TtmError::InvalidArgument("page array missing for move".into()));
        };
        if old_type != mem_type::SYSTEM {
            ttm.unbind();
        }
        ttm.set_placement_caching(mem.flags);
        if mem.mem_type != mem_type::SYSTEM {
            ttm.bind(mem.mem_type)?;
        }
        self.adopt_placement(st, mem);
        Ok(())
    }

    /// Generic copy through the CPU, for moves in and out of fixed memory.
    fn move_memcpy(
        &self,
        bo: &BufferObject,
        st: &mut StateGuard<'_>,
        mem: &mut MemReg,
        new_fixed: bool,
    ) -> TtmResult<()> {
        let (old_io, new_io) = {
            let lru = self.lru.lock();
            (
                lru.man[st.mem.mem_type as usize].io_mem(),
                lru.man[mem.mem_type as usize].io_mem(),
            )
        };

        let mut buf = vec![0u8; pages_to_bytes(bo.num_pages()) as usize];
        let have_source = match (&old_io, st.mem.node) {
            (Some(io), Some(node)) => {
                io.read(node.start, &mut buf);
                true
            }
            _ => match st.ttm.as_mut() {
                Some(ttm) if ttm.is_populated() || ttm.is_swapped() => {
                    ttm.read(0, &mut buf)?;
                    true
                }
                _ => false,
            },
        };

        if have_source {
            match (&new_io, mem.node) {
                (Some(io), Some(node)) => io.write(node.start, &buf),
                _ => match st.ttm.as_mut() {
                    Some(ttm) => ttm.write(0, &buf)?,
                    None => return Err(TtmError::InvalidArgument("no destination for copy".into())),
                },
            }
        }

        self.finish_fixed_move(st, mem, new_fixed);
        Ok(())
    }

    fn finish_fixed_move(&self, st: &mut StateGuard<'_>, mem: &mut MemReg, new_fixed: bool) {
        if new_fixed {
            st.ttm = None;
        }
        self.adopt_placement(st, mem);
    }

    /// Makes `mem` the buffer's placement and frees the old range.
    fn adopt_placement(&self, st: &mut StateGuard<'_>, mem: &mut MemReg) {
        let old = std::mem::replace(&mut st.mem, mem.clone());
        mem.node = None;
        st.mem.proposed_flags = old.proposed_flags;
        if let Some(node) = old.node {
            self.free_node(old.mem_type, node);
        }
    }

    fn io_window(&self, st: &BoState) -> Option<(Arc<IoMemory>, u64)> {
        let node = st.mem.node?;
        let io = self.lru.lock().man[st.mem.mem_type as usize].io_mem()?;
        Some((io, node.start))
    }

    fn check_access(bo: &BufferObject, offset: usize, len: usize) -> TtmResult<()> {
        let size = pages_to_bytes(bo.num_pages()) as usize;
        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(TtmError::InvalidArgument(format!(
                "access {offset}+{len} beyond buffer of {size} bytes"
            )));
        }
        Ok(())
    }

    /// CPU read of a reserved buffer, from wherever it currently lives.
    pub(crate) fn cpu_read(
        &self,
        bo: &BufferObject,
        offset: usize,
        dst: &mut [u8],
    ) -> TtmResult<()> {
        Self::check_access(bo, offset, dst.len())?;
        let mut st = bo.state.lock();
        if let Some((io, start)) = self.io_window(&st) {
            let first = offset / PAGE_SIZE;
            let skip = offset % PAGE_SIZE;
            let mut pages = vec![0u8; (skip + dst.len()).div_ceil(PAGE_SIZE) * PAGE_SIZE];
            io.read(start + first as u64, &mut pages);
            dst.copy_from_slice(&pages[skip..skip + dst.len()]);
            return Ok(());
        }
        st.ttm.get_or_insert_with(|| self.add_ttm(bo)).read(offset, dst)
    }

    /// CPU write to a reserved buffer, wherever it currently lives.
    pub(crate) fn cpu_write(&self, bo: &BufferObject, offset: usize, src: &[u8]) -> TtmResult<()> {
        Self::check_access(bo, offset, src.len())?;
        let mut st = bo.state.lock();
        if let Some((io, start)) = self.io_window(&st) {
            let first = start + (offset / PAGE_SIZE) as u64;
            let skip = offset % PAGE_SIZE;
            let mut pages = vec![0u8; (skip + src.len()).div_ceil(PAGE_SIZE) * PAGE_SIZE];
            io.read(first, &mut pages);
            pages[skip..skip + src.len()].copy_from_slice(src);
            io.write(first, &pages);
            return Ok(());
        }
        st.ttm.get_or_insert_with(|| self.add_ttm(bo)).write(offset, src)
    }
}
