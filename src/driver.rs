use crate::bo::BufferObject;
use crate::error::TtmResult;
use crate::placement::{MemReg, PlacementFlags};
use bitflags::bitflags;

bitflags! {
    /// Capabilities of a memory type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemTypeFlags: u32 {
        /// Not backed by system pages; contents live in device memory.
        const FIXED = 1 << 0;
        /// CPU can map it.
        const MAPPABLE = 1 << 1;
        /// Backed by contiguous system memory reachable without the aperture.
        const CMA = 1 << 3;
    }
}

/// Description of a placement class returned by [`BoDriver::init_mem_type`].
#[derive(Debug, Clone)]
pub struct MemTypeConfig {
    pub flags: MemTypeFlags,
    pub available_caching: PlacementFlags,
    pub default_caching: PlacementFlags,
    /// GPU address of page 0 of this type.
    pub gpu_offset: u64,
    /// Bus address of page 0 of this type, for mappable fixed memory.
    pub io_offset: u64,
}

impl Default for MemTypeConfig {
    fn default() -> Self {
        Self {
            flags: MemTypeFlags::MAPPABLE,
            available_caching: PlacementFlags::MASK_CACHING,
            default_caching: PlacementFlags::CACHED,
            gpu_offset: 0,
            io_offset: 0,
        }
    }
}

impl MemTypeConfig {
    /// System memory: cached, mappable, not fixed.
    #[must_use]
    pub fn system() -> Self {
        Self::default()
    }

    /// Device-local memory with its own contents.
    #[must_use]
    pub fn fixed(gpu_offset: u64) -> Self {
        Self {
            flags: MemTypeFlags::FIXED | MemTypeFlags::MAPPABLE,
            available_caching: PlacementFlags::UNCACHED | PlacementFlags::WC,
            default_caching: PlacementFlags::WC,
            gpu_offset,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn flags(mut self, flags: MemTypeFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn caching(mut self, available: PlacementFlags, default: PlacementFlags) -> Self {
        self.available_caching = available;
        self.default_caching = default;
        self
    }

    #[must_use]
    pub const fn io(mut self, io_offset: u64) -> Self {
        self.io_offset = io_offset;
        self
    }
}

/// A driver-supplied data mover, used when either side of a move is fixed
/// memory.
pub trait BoMover: Send + Sync {
    /// Copy the contents of `bo` from `old` to `new`. The buffer manager
    /// updates the placement record once this returns `Ok`.
    ///
    /// Called with the buffer mutex held: use `old` and `new`, not the
    /// buffer's placement accessors.
    fn move_bo(
        &self,
        bo: &BufferObject,
        evict: bool,
        interruptible: bool,
        no_wait: bool,
        old: &MemReg,
        new: &MemReg,
    ) -> TtmResult<()>;
}

/// The capabilities the surrounding graphics driver hands to the device.
pub trait BoDriver: Send + Sync {
    /// Describe memory type `mem_type`. Called once per `init_mm`.
    fn init_mem_type(&self, mem_type: u32) -> TtmResult<MemTypeConfig>;

    /// Memory types to try for free space, in order.
    fn mem_type_prio(&self) -> &[u32];

    /// Memory types to evict from when nothing is free, in order.
    fn mem_busy_prio(&self) -> &[u32];

    /// Where an evicted buffer should go.
    fn evict_flags(&self, bo: &BufferObject, mem: &MemReg) -> PlacementFlags;

    /// Optional custom mover; `None` selects the generic copy mover.
    fn mover(&self) -> Option<&dyn BoMover> {
        None
    }

    /// Flush GPU read caches for a buffer coming back after eviction.
    fn invalidate_caches(&self, _flags: PlacementFlags) -> TtmResult<()> {
        Ok(())
    }
}

/// The CPU mapping space buffers are mmapped through.
pub trait AddressSpaceMapping: Send + Sync {
    /// Kill every CPU mapping of the byte range `[offset, offset + len)`.
    fn unmap_range(&self, offset: u64, len: u64);
}
