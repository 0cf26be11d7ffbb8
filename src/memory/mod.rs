pub mod global;
pub mod range;
pub mod type_manager;

/// A range of pages handed out by a [`RangeAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub start: u64,     // First page
    pub num_pages: u64, // Length in pages
}

impl Extent {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.num_pages
    }

    #[must_use]
    pub const fn contains(&self, page: u64) -> bool {
        page >= self.start && page < self.end()
    }
}

/// Trait for free-space allocators backing a memory type or an address space.
pub trait RangeAllocator {
    /// Finds and claims `num_pages` aligned to `alignment` pages.
    fn allocate(&mut self, num_pages: u64, alignment: u64) -> Option<Extent>;

    /// Returns a previously claimed extent to the free pool.
    fn free(&mut self, extent: Extent);

    /// Get the allocator's first page and page count.
    fn bounds(&self) -> (u64, u64);

    /// Number of pages currently claimed.
    fn used_pages(&self) -> u64;

    /// `true` when nothing is claimed.
    fn is_clean(&self) -> bool {
        self.used_pages() == 0
    }
}

// Re-export the main types for easy access
pub use global::{MemAccounting, MemGlobal};
pub use range::RangeManager;
pub use type_manager::{IoMemory, LruList, MemTypeManager, MemTypeStats};
