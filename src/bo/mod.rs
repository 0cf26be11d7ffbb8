pub mod refs;
pub mod reserve;

mod move_mem;
mod validate;

use crate::device::BoDevice;
use crate::error::{TtmError, TtmResult};
use crate::memory::Extent;
use crate::placement::{MemReg, PlacementFlags, mem_type};
use crate::sync::{SyncRef, WaitQueue};
use crate::tt::Tt;
use crate::utils::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, bo_acc_size, pages_for};
use bitflags::bitflags;
use parking_lot::Mutex;
use reserve::Reservation;
use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, error};

pub use refs::BoRef;
pub use reserve::Reserved;

/// Stable handle of a buffer object within its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoId(pub u64);

impl std::fmt::Display for BoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bo#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoType {
    /// Mappable by user space through the device address space.
    Device,
    /// Used only inside the driver.
    Kernel,
    /// Wraps user pages; never placed in fixed memory.
    User,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PrivFlags: u32 {
        /// The last move was an eviction; GPU read caches are stale.
        const EVICTED = 1 << 0;
        /// The sync object guards an in-flight move.
        const MOVING = 1 << 1;
    }
}

/// Mutable per-buffer state, guarded by the buffer mutex.
#[derive(Debug)]
pub struct BoState {
    pub(crate) mem: MemReg,
    pub(crate) proposed_flags: PlacementFlags,
    pub(crate) ttm: Option<Tt>,
    pub(crate) sync_obj: Option<SyncRef>,
    pub(crate) priv_flags: PrivFlags,
    /// GPU address of the buffer in its current placement.
    pub(crate) offset: u64,
}

/// Parameters for [`BoDevice::create`].
#[derive(Debug, Clone)]
pub struct BoParams {
    pub size: u64,
    pub bo_type: BoType,
    pub flags: PlacementFlags,
    pub page_alignment: u64,
    pub buffer_start: u64,
    pub interruptible: bool,
    /// Caller may pin buffers (`NO_EVICT`).
    pub privileged: bool,
    pub persistent_swap_storage: Option<Arc<File>>,
}

impl BoParams {
    #[must_use]
    pub const fn new(size: u64, bo_type: BoType) -> Self {
        Self {
            size,
            bo_type,
            flags: PlacementFlags::SYSTEM,
            page_alignment: 0,
            buffer_start: 0,
            interruptible: false,
            privileged: false,
            persistent_swap_storage: None,
        }
    }

    #[must_use]
    pub const fn flags(mut self, flags: PlacementFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn page_alignment(mut self, pages: u64) -> Self {
        self.page_alignment = pages;
        self
    }

    #[must_use]
    pub const fn buffer_start(mut self, addr: u64) -> Self {
        self.buffer_start = addr;
        self
    }

    #[must_use]
    pub const fn interruptible(mut self) -> Self {
        self.interruptible = true;
        self
    }

    #[must_use]
    pub const fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    #[must_use]
    pub fn persistent_swap_storage(mut self, file: Arc<File>) -> Self {
        self.persistent_swap_storage = Some(file);
        self
    }
}

/// A GPU-visible memory allocation.
#[derive(Debug)]
pub struct BufferObject {
    id: BoId,
    bo_type: BoType,
    num_pages: u64,
    buffer_start: u64,
    acc_size: usize,
    persistent_swap_storage: Option<Arc<File>>,
    /// Byte offset in the device address space, `0` if none.
    addr_space_offset: AtomicU64,

    pub(crate) kref: AtomicUsize,
    pub(crate) list_kref: AtomicUsize,
    cpu_writers: AtomicUsize,

    pub(crate) reservation: Reservation,
    /// Woken on unreserve and when the last CPU writer leaves.
    pub(crate) event_queue: WaitQueue,
    pub(crate) state: Mutex<BoState>,
}

impl BufferObject {
    #[must_use]
    pub const fn id(&self) -> BoId {
        self.id
    }

    #[must_use]
    pub const fn bo_type(&self) -> BoType {
        self.bo_type
    }

    #[must_use]
    pub const fn num_pages(&self) -> u64 {
        self.num_pages
    }

    #[must_use]
    pub const fn buffer_start(&self) -> u64 {
        self.buffer_start
    }

    #[must_use]
    pub const fn acc_size(&self) -> usize {
        self.acc_size
    }

    #[must_use]
    pub fn persistent_swap_storage(&self) -> Option<&Arc<File>> {
        self.persistent_swap_storage.as_ref()
    }

    /// Byte offset to mmap this buffer at, for device buffers.
    #[must_use]
    pub fn addr_space_offset(&self) -> u64 {
        self.addr_space_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_addr_space_offset(&self, offset: u64) {
        self.addr_space_offset.store(offset, Ordering::Release);
    }

    #[must_use]
    pub fn strong_count(&self) -> usize {
        self.kref.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn list_count(&self) -> usize {
        self.list_kref.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn cpu_writers(&self) -> usize {
        self.cpu_writers.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn mem_type(&self) -> u32 {
        self.state.lock().mem.mem_type
    }

    /// Snapshot of the placement record.
    #[must_use]
    pub fn mem_reg(&self) -> MemReg {
        self.state.lock().mem.clone()
    }

    /// Current placement: memory type, caching and access bits.
    #[must_use]
    pub fn placement_flags(&self) -> PlacementFlags {
        self.state.lock().mem.flags
    }

    #[must_use]
    pub fn proposed_flags(&self) -> PlacementFlags {
        self.state.lock().proposed_flags
    }

    /// Allocated range in the current memory type.
    #[must_use]
    pub fn extent(&self) -> Option<Extent> {
        self.state.lock().mem.node
    }

    /// GPU address in the current placement.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.state.lock().offset
    }

    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.state.lock().priv_flags.contains(PrivFlags::EVICTED)
    }

    #[must_use]
    pub fn has_sync_obj(&self) -> bool {
        self.state.lock().sync_obj.is_some()
    }

    #[must_use]
    pub fn has_backing_pages(&self) -> bool {
        self.state.lock().ttm.is_some()
    }

    #[must_use]
    pub fn is_swapped(&self) -> bool {
        self.state.lock().ttm.as_ref().is_some_and(Tt::is_swapped)
    }

    /// Validates a placement change requested by a client.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when user buffers lose cache coherency, or when
    /// an unprivileged caller touches `NO_EVICT` state.
    pub fn check_placement(
        &self,
        set_flags: PlacementFlags,
        clr_flags: PlacementFlags,
        privileged: bool,
    ) -> TtmResult<()> {
        let new_mask = set_flags | clr_flags;

        if self.bo_type == BoType::User && clr_flags.contains(PlacementFlags::CACHED) {
            error!(bo = %self.id, "User buffers require cache-coherent memory");
            return Err(TtmError::InvalidArgument("user buffer must stay cached".into()));
        }

        if !privileged {
            if new_mask.contains(PlacementFlags::NO_EVICT) {
                error!(bo = %self.id, "Need to be privileged to modify NO_EVICT status");
                return Err(TtmError::InvalidArgument("NO_EVICT needs privilege".into()));
            }
            let cur = self.state.lock().mem.flags;
            if (clr_flags & cur).intersects(PlacementFlags::MASK_MEMTYPE)
                && cur.contains(PlacementFlags::NO_EVICT)
            {
                error!(bo = %self.id, "Incompatible memory specification for NO_EVICT buffer");
                return Err(TtmError::InvalidArgument("NO_EVICT buffer cannot move".into()));
            }
        }
        Ok(())
    }

    pub(crate) fn cpu_writer_grabbed(&self) {
        self.cpu_writers.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one CPU writer, waking waiters when the last one leaves.
    pub fn synccpu_write_release(&self) {
        if self.cpu_writers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.event_queue.wake_all();
        }
    }
}

impl BoDevice {
    /// Creates a buffer object and validates it into its initial placement.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero or overflowing size, an overflowing
    /// alignment or a rejected placement, `OutOfMemory`
    /// when neither accounting nor placement can be satisfied, or any error
    /// from the initial validation.
    pub fn create(self: &Arc<Self>, params: BoParams) -> TtmResult<BoRef> {
        let Some(num_pages) = params
            .size
            .checked_add(params.buffer_start & !PAGE_MASK)
            .and_then(pages_for)
        else {
            error!(size = params.size, "Buffer object size overflows");
            return Err(TtmError::InvalidArgument("buffer object size overflows".into()));
        };
        if num_pages == 0 {
            error!("Illegal buffer object size");
            return Err(TtmError::InvalidArgument("zero-sized buffer object".into()));
        }
        if params.page_alignment.checked_mul(PAGE_SIZE as u64).is_none() {
            error!(alignment = params.page_alignment, "Illegal buffer object alignment");
            return Err(TtmError::InvalidArgument("page alignment overflows".into()));
        }

        let Some(acc_size) = bo_acc_size(std::mem::size_of::<BufferObject>(), num_pages) else {
            error!(pages = num_pages, "Buffer object bookkeeping size overflows");
            return Err(TtmError::InvalidArgument("buffer object size overflows".into()));
        };
        self.account(acc_size)?;

        let id = self.next_bo_id();
        let bo = Arc::new(BufferObject {
            id,
            bo_type: params.bo_type,
            num_pages,
            buffer_start: params.buffer_start & PAGE_MASK,
            acc_size,
            persistent_swap_storage: params.persistent_swap_storage,
            addr_space_offset: AtomicU64::new(0),
            kref: AtomicUsize::new(1),
            list_kref: AtomicUsize::new(1),
            cpu_writers: AtomicUsize::new(0),
            reservation: Reservation::new_reserved(),
            event_queue: WaitQueue::new(),
            state: Mutex::new(BoState {
                mem: MemReg {
                    mem_type: mem_type::SYSTEM,
                    num_pages,
                    page_alignment: params.page_alignment,
                    node: None,
                    flags: PlacementFlags::SYSTEM | PlacementFlags::CACHED,
                    proposed_flags: PlacementFlags::empty(),
                },
                proposed_flags: PlacementFlags::empty(),
                ttm: None,
                sync_obj: None,
                priv_flags: PrivFlags::empty(),
                offset: 0,
            }),
        });
        self.insert_object(&bo);
        let bo = BoRef::from_counted(self.clone(), bo);

        let reserved = Reserved::adopt(&bo);
        let result = self.init_placement(
            &reserved,
            params.flags,
            params.interruptible,
            params.privileged,
        );
        drop(reserved);

        result?;
        debug!(bo = %id, pages = num_pages, "Created buffer object");
        Ok(bo)
    }

    fn init_placement(
        &self,
        reserved: &Reserved<'_>,
        mut flags: PlacementFlags,
        interruptible: bool,
        privileged: bool,
    ) -> TtmResult<()> {
        let bo = reserved.bo();
        bo.check_placement(flags, PlacementFlags::empty(), privileged)?;

        // If no caching attributes are set, accept any form of caching.
        if !flags.intersects(PlacementFlags::MASK_CACHING) {
            flags |= PlacementFlags::MASK_CACHING;
        }

        if bo.bo_type() == BoType::Device {
            self.setup_vm(bo)?;
        }

        self.validate_bo(bo, flags, interruptible, false)
    }

    /// Charges `size` bytes, swapping buffers out while the budget is full.
    pub(crate) fn account(&self, size: usize) -> TtmResult<()> {
        loop {
            match self.mem_glob().alloc(size, false) {
                Err(TtmError::OutOfMemory) => {
                    if self.swapout().is_err() {
                        return Err(TtmError::OutOfMemory);
                    }
                }
                other => return other,
            }
        }
    }
}

/// Byte offset helper shared by the move and mapping paths.
pub(crate) const fn page_bytes(page: u64) -> u64 {
    page << PAGE_SHIFT
}
