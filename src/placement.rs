use crate::memory::Extent;
use bitflags::bitflags;

/// Memory type ids. The table of memory type managers is indexed by these.
pub mod mem_type {
    pub const SYSTEM: u32 = 0;
    pub const TT: u32 = 1;
    pub const VRAM: u32 = 2;
    pub const PRIV0: u32 = 3;
    pub const PRIV1: u32 = 4;
    pub const PRIV2: u32 = 5;
    pub const PRIV3: u32 = 6;
    pub const PRIV4: u32 = 7;
}

pub const NUM_MEM_TYPES: usize = 8;

bitflags! {
    /// Placement request / placement state bits.
    ///
    /// The low 16 bits select memory types (bit `n` is memory type `n`), the
    /// next byte holds caching modes, and the rest are access and pinning bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PlacementFlags: u32 {
        const SYSTEM = 1 << mem_type::SYSTEM;
        const TT = 1 << mem_type::TT;
        const VRAM = 1 << mem_type::VRAM;
        const PRIV0 = 1 << mem_type::PRIV0;
        const PRIV1 = 1 << mem_type::PRIV1;
        const PRIV2 = 1 << mem_type::PRIV2;
        const PRIV3 = 1 << mem_type::PRIV3;
        const PRIV4 = 1 << mem_type::PRIV4;

        const CACHED = 1 << 16;
        const UNCACHED = 1 << 17;
        const WC = 1 << 18;

        const SHARED = 1 << 20;
        const NO_EVICT = 1 << 21;

        const READ = 1 << 24;
        const WRITE = 1 << 25;
        const EXE = 1 << 26;
    }
}

impl PlacementFlags {
    pub const MASK_MEM: Self = Self::from_bits_retain(0x0000_FFFF);
    pub const MASK_CACHING: Self = Self::CACHED.union(Self::UNCACHED).union(Self::WC);
    pub const MASK_MEMTYPE: Self = Self::MASK_MEM.union(Self::MASK_CACHING);

    /// The placement bit for a single memory type.
    #[must_use]
    pub const fn for_mem_type(mem_type: u32) -> Self {
        Self::from_bits_retain(1 << mem_type)
    }

    /// Replaces the bits selected by `mask` with the corresponding bits of `new`.
    #[must_use]
    pub fn masked(self, new: Self, mask: Self) -> Self {
        (self & !mask) | (new & mask)
    }
}

/// Caching mode of a placement, derived from the caching bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caching {
    Cached,
    WriteCombined,
    Uncached,
}

impl Caching {
    #[must_use]
    pub fn from_flags(flags: PlacementFlags) -> Self {
        if flags.contains(PlacementFlags::CACHED) {
            Self::Cached
        } else if flags.contains(PlacementFlags::WC) {
            Self::WriteCombined
        } else {
            Self::Uncached
        }
    }
}

/// The placement record of a buffer object: where it lives and with which
/// attributes.
#[derive(Debug, Clone)]
pub struct MemReg {
    pub mem_type: u32,
    pub num_pages: u64,
    pub page_alignment: u64,
    /// Allocated range in the memory type. `None` for system memory.
    pub node: Option<Extent>,
    pub flags: PlacementFlags,
    pub proposed_flags: PlacementFlags,
}

impl MemReg {
    /// A record describing an unplaced request of `num_pages`.
    #[must_use]
    pub const fn request(num_pages: u64, page_alignment: u64, proposed: PlacementFlags) -> Self {
        Self {
            mem_type: mem_type::SYSTEM,
            num_pages,
            page_alignment,
            node: None,
            flags: PlacementFlags::empty(),
            proposed_flags: proposed,
        }
    }

    /// Whether the current placement already satisfies the proposed flags, in
    /// both memory type and caching.
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        let common = self.proposed_flags & self.flags;
        common.intersects(PlacementFlags::MASK_MEM)
            && common.intersects(PlacementFlags::MASK_CACHING)
    }
}
