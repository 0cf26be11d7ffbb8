#![allow(clippy::cast_possible_truncation)]

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = !((PAGE_SIZE as u64) - 1);

/// Half of the sequence space. Sequence `a` is at or ahead of `b` when
/// `a - b` (mod 2^32) falls below this.
const SEQ_HALF_RANGE: u32 = 1 << 31;

/// Pages needed to hold `bytes`. `None` when the rounding overflows.
#[must_use]
pub const fn pages_for(bytes: u64) -> Option<u64> {
    match bytes.checked_add(PAGE_SIZE as u64 - 1) {
        Some(end) => Some(end >> PAGE_SHIFT),
        None => None,
    }
}

#[must_use]
pub const fn pages_to_bytes(pages: u64) -> u64 {
    pages << PAGE_SHIFT
}

/// Rounds `val` up to a multiple of `align`. `None` on overflow.
#[must_use]
pub const fn align_up(val: u64, align: u64) -> Option<u64> {
    if align <= 1 {
        return Some(val);
    }
    val.div_ceil(align).checked_mul(align)
}

/// Returns `true` when a transaction carrying `sequence` must back off from an
/// object already reserved by a transaction carrying `holder`.
///
/// The caller backs off when it is not newer than the holder. The difference
/// is taken modulo 2^32 and tested against 2^31, so ordering survives wrap.
#[must_use]
pub const fn seq_must_back_off(sequence: u32, holder: u32) -> bool {
    holder.wrapping_sub(sequence) < SEQ_HALF_RANGE
}

/// Accounted size of a buffer object: the struct itself plus two page arrays.
#[must_use]
pub const fn bo_acc_size(struct_size: usize, num_pages: u64) -> Option<usize> {
    let Some(bytes) = (num_pages as usize).checked_mul(std::mem::size_of::<usize>()) else {
        return None;
    };
    let Some(page_array) = bytes.div_ceil(PAGE_SIZE).checked_mul(PAGE_SIZE) else {
        return None;
    };
    match page_array.checked_mul(2) {
        Some(arrays) => struct_size.checked_add(arrays),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(pages_for(0), Some(0));
        assert_eq!(pages_for(1), Some(1));
        assert_eq!(pages_for(4096), Some(1));
        assert_eq!(pages_for(4097), Some(2));
        assert_eq!(pages_for(u64::MAX), None);
        assert_eq!(pages_to_bytes(3), 12288);
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(5, 0), Some(5));
        assert_eq!(align_up(5, 1), Some(5));
        assert_eq!(align_up(5, 4), Some(8));
        assert_eq!(align_up(6, 3), Some(6));
        assert_eq!(align_up(0, u64::MAX), Some(0));
        assert_eq!(align_up(4, u64::MAX), None);
    }

    #[test]
    fn sequence_comparison_wraps() {
        // Older caller against a newer holder restarts.
        assert!(seq_must_back_off(5, 10));
        // Newer caller against an older holder waits its turn.
        assert!(!seq_must_back_off(10, 5));
        assert!(seq_must_back_off(7, 7));
        // Across the wrap, 2 is newer than u32::MAX - 1.
        assert!(!seq_must_back_off(2, u32::MAX - 1));
        assert!(seq_must_back_off(u32::MAX - 1, 2));
    }

    #[test]
    fn accounted_size_includes_page_arrays() {
        assert_eq!(bo_acc_size(512, 1), Some(512 + 2 * PAGE_SIZE));
        let many = (PAGE_SIZE / std::mem::size_of::<usize>()) as u64 + 1;
        assert_eq!(bo_acc_size(512, many), Some(512 + 4 * PAGE_SIZE));
        assert_eq!(bo_acc_size(512, u64::MAX), None);
    }
}
