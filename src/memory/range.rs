use super::{Extent, RangeAllocator};
use crate::utils::align_up;
use std::collections::BTreeMap;
use tracing::error;

/// Tracks a managed range of pages.
///
/// Occupied ranges are kept as `start -> len` so holes can be found with an
/// ordered walk.
#[derive(Debug, Default)]
pub struct RangeManager {
    start: u64,
    size: u64,
    used: u64,

    // Tracks occupied ranges: Start Page -> Page Count
    allocations: BTreeMap<u64, u64>,
}

impl RangeManager {
    #[must_use]
    pub fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            size,
            used: 0,
            allocations: BTreeMap::new(),
        }
    }

    /// First-fit search for a hole of `num_pages` aligned to `alignment`.
    /// Does not claim anything. Alignments that push the search past the end
    /// of the address range find nothing.
    #[must_use]
    pub fn search_free(&self, num_pages: u64, alignment: u64) -> Option<Extent> {
        if num_pages == 0 {
            return None;
        }
        let limit = self.start.saturating_add(self.size);
        let mut candidate = align_up(self.start, alignment)?;

        // Iterate over existing allocations to find a hole
        for (&alloc_start, &alloc_len) in &self.allocations {
            if alloc_start >= candidate && alloc_start - candidate >= num_pages {
                return Some(Extent {
                    start: candidate,
                    num_pages,
                });
            }
            candidate = candidate.max(align_up(alloc_start + alloc_len, alignment)?);
        }

        // Check space after the last allocation (or if map was empty)
        let end = candidate.checked_add(num_pages)?;
        (end <= limit).then_some(Extent {
            start: candidate,
            num_pages,
        })
    }

    /// Pages that could be claimed if every allocation were released.
    #[must_use]
    pub const fn free_pages(&self) -> u64 {
        self.size - self.used
    }

    /// Iterates over the claimed extents in address order.
    pub fn extents(&self) -> impl Iterator<Item = Extent> + '_ {
        self.allocations.iter().map(|(&start, &num_pages)| Extent { start, num_pages })
    }
}

impl RangeAllocator for RangeManager {
    fn allocate(&mut self, num_pages: u64, alignment: u64) -> Option<Extent> {
        let extent = self.search_free(num_pages, alignment)?;
        self.allocations.insert(extent.start, extent.num_pages);
        self.used += extent.num_pages;
        Some(extent)
    }

    fn free(&mut self, extent: Extent) {
        match self.allocations.remove(&extent.start) {
            Some(len) => {
                debug_assert_eq!(len, extent.num_pages);
                self.used -= len;
            }
            None => error!(
                start = extent.start,
                pages = extent.num_pages,
                "Tried to free an extent which was not tracked"
            ),
        }
    }

    fn bounds(&self) -> (u64, u64) {
        (self.start, self.size)
    }

    fn used_pages(&self) -> u64 {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_fills_holes() {
        let mut mm = RangeManager::new(0, 16);
        let a = mm.allocate(4, 0).unwrap();
        let b = mm.allocate(4, 0).unwrap();
        let c = mm.allocate(4, 0).unwrap();
        assert_eq!((a.start, b.start, c.start), (0, 4, 8));

        mm.free(b);
        assert_eq!(mm.used_pages(), 8);
        let d = mm.allocate(3, 0).unwrap();
        assert_eq!(d.start, 4);
        let e = mm.allocate(4, 0).unwrap();
        assert_eq!(e.start, 12);
        assert!(mm.allocate(2, 0).is_none());
    }

    #[test]
    fn alignment_is_honored() {
        let mut mm = RangeManager::new(1, 32);
        let a = mm.allocate(1, 8).unwrap();
        assert_eq!(a.start, 8);
        let b = mm.allocate(2, 8).unwrap();
        assert_eq!(b.start, 16);
        let c = mm.allocate(1, 0).unwrap();
        assert_eq!(c.start, 1);
    }

    #[test]
    fn exhausts_and_cleans() {
        let mut mm = RangeManager::new(100, 8);
        let all = mm.allocate(8, 0).unwrap();
        assert_eq!(all, Extent { start: 100, num_pages: 8 });
        assert!(mm.search_free(1, 0).is_none());
        assert_eq!(mm.free_pages(), 0);
        mm.free(all);
        assert!(mm.is_clean());
        assert_eq!(mm.bounds(), (100, 8));
    }

    #[test]
    fn huge_alignment_finds_nothing_past_the_end() {
        let mut mm = RangeManager::new(0, 16);
        mm.allocate(4, 0).unwrap();
        assert!(mm.search_free(1, u64::MAX).is_none());
        assert!(mm.search_free(u64::MAX, 0).is_none());
        assert!(mm.allocate(1, 1 << 40).is_none());
    }

    #[test]
    fn zero_pages_never_fit() {
        let mm = RangeManager::new(0, 8);
        assert!(mm.search_free(0, 0).is_none());
    }
}
