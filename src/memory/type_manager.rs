use super::{Extent, RangeAllocator, RangeManager};
use crate::bo::BoId;
use crate::driver::{MemTypeConfig, MemTypeFlags};
use crate::placement::{MemReg, PlacementFlags, mem_type};
use crate::utils::PAGE_SIZE;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An ordered set of buffer handles. Oldest entries come out first.
#[derive(Debug, Default)]
pub struct LruList {
    order: BTreeMap<u64, BoId>,
    index: HashMap<BoId, u64>,
    next: u64,
}

impl LruList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `id` at the tail. Returns `false` if it was already linked.
    pub fn push_back(&mut self, id: BoId) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        let stamp = self.next;
        self.next += 1;
        self.order.insert(stamp, id);
        self.index.insert(id, stamp);
        true
    }

    /// Unlinks `id`. Returns `false` if it was not linked.
    pub fn remove(&mut self, id: BoId) -> bool {
        match self.index.remove(&id) {
            Some(stamp) => {
                self.order.remove(&stamp);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn front(&self) -> Option<BoId> {
        self.order.values().next().copied()
    }

    #[must_use]
    pub fn contains(&self, id: BoId) -> bool {
        self.index.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = BoId> + '_ {
        self.order.values().copied()
    }
}

/// Contents of fixed memory, page-granular and sparse. Unwritten pages read
/// as zero.
#[derive(Debug, Default)]
pub struct IoMemory {
    pages: Mutex<HashMap<u64, Box<[u8]>>>,
}

impl IoMemory {
    /// Copies `num_pages` starting at `first_page` into `dst`.
    pub fn read(&self, first_page: u64, dst: &mut [u8]) {
        let pages = self.pages.lock();
        for (i, chunk) in dst.chunks_mut(PAGE_SIZE).enumerate() {
            match pages.get(&(first_page + i as u64)) {
                Some(page) => chunk.copy_from_slice(&page[..chunk.len()]),
                None => chunk.fill(0),
            }
        }
    }

    /// Copies `src` into the pages starting at `first_page`.
    pub fn write(&self, first_page: u64, src: &[u8]) {
        let mut pages = self.pages.lock();
        for (i, chunk) in src.chunks(PAGE_SIZE).enumerate() {
            let page = pages
                .entry(first_page + i as u64)
                .or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
            page[..chunk.len()].copy_from_slice(chunk);
        }
    }

    /// Forgets the contents of an extent that is being released.
    pub fn discard(&self, extent: Extent) {
        let mut pages = self.pages.lock();
        for page in extent.start..extent.end() {
            pages.remove(&page);
        }
    }
}

/// Snapshot of a memory type for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemTypeStats {
    pub mem_type: u32,
    pub enabled: bool,
    pub size: u64,
    pub used_pages: u64,
    pub lru_len: usize,
}

/// One placement class: its capabilities, free-space allocator and LRU of
/// resident, evictable buffers.
#[derive(Debug, Default)]
pub struct MemTypeManager {
    pub(crate) has_type: bool,
    pub(crate) use_type: bool,
    mem_type: u32,
    config: Option<MemTypeConfig>,
    size: u64,
    pub(crate) manager: RangeManager,
    pub(crate) lru: LruList,
    io_mem: Option<Arc<IoMemory>>,
}

impl MemTypeManager {
    /// Brings the type up with `size` pages starting at page `offset`.
    pub(crate) fn init(&mut self, mem_type: u32, config: MemTypeConfig, offset: u64, size: u64) {
        let fixed = config.flags.contains(MemTypeFlags::FIXED);
        self.mem_type = mem_type;
        self.io_mem = fixed.then(|| Arc::new(IoMemory::default()));
        self.config = Some(config);
        self.manager = RangeManager::new(offset, size);
        self.lru = LruList::new();
        self.size = size;
        self.has_type = true;
        self.use_type = true;
    }

    /// Tears the allocator down. Callers check `is_clean` first.
    pub(crate) fn takedown(&mut self) {
        self.has_type = false;
        self.use_type = false;
        self.io_mem = None;
        self.manager = RangeManager::default();
    }

    #[must_use]
    pub fn flags(&self) -> MemTypeFlags {
        self.config.as_ref().map_or_else(MemTypeFlags::empty, |c| c.flags)
    }

    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.flags().contains(MemTypeFlags::FIXED)
    }

    #[must_use]
    pub fn gpu_offset(&self) -> u64 {
        self.config.as_ref().map_or(0, |c| c.gpu_offset)
    }

    #[must_use]
    pub fn io_offset(&self) -> u64 {
        self.config.as_ref().map_or(0, |c| c.io_offset)
    }

    #[must_use]
    pub(crate) fn io_mem(&self) -> Option<Arc<IoMemory>> {
        self.io_mem.clone()
    }

    /// Searches the free-space allocator and claims an extent.
    pub fn find_space(&mut self, num_pages: u64, alignment: u64) -> Option<Extent> {
        self.manager.allocate(num_pages, alignment)
    }

    /// Checks whether a request with placement `mask` can live in this type,
    /// and returns the memory-type and caching bits it would get.
    ///
    /// Fixed types are refused when `disallow_fixed` is set (user buffers).
    #[must_use]
    pub fn compatible_flags(
        &self,
        disallow_fixed: bool,
        mask: PlacementFlags,
    ) -> Option<PlacementFlags> {
        let config = self.config.as_ref()?;
        let mut cur = PlacementFlags::for_mem_type(self.mem_type);

        if self.is_fixed() && disallow_fixed {
            return None;
        }
        if !(cur & mask).intersects(PlacementFlags::MASK_MEM) {
            return None;
        }
        if !mask.intersects(config.available_caching) {
            return None;
        }

        cur |= if mask.intersects(config.default_caching) {
            config.default_caching
        } else if mask.contains(PlacementFlags::CACHED) {
            PlacementFlags::CACHED
        } else if mask.contains(PlacementFlags::WC) {
            PlacementFlags::WC
        } else {
            PlacementFlags::UNCACHED
        };
        Some(cur)
    }

    /// Whether `mem` is reached over the bus rather than as system pages.
    #[must_use]
    pub fn reg_is_pci(&self, mem: &MemReg) -> bool {
        if !self.is_fixed() {
            if mem.mem_type == mem_type::SYSTEM || self.flags().contains(MemTypeFlags::CMA) {
                return false;
            }
            if mem.flags.contains(PlacementFlags::CACHED) {
                return false;
            }
        }
        true
    }

    #[must_use]
    pub fn stats(&self) -> MemTypeStats {
        MemTypeStats {
            mem_type: self.mem_type,
            enabled: self.has_type && self.use_type,
            size: self.size,
            used_pages: self.manager.used_pages(),
            lru_len: self.lru.len(),
        }
    }
}
