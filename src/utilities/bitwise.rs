//! Bit level checks for NOR style media, where programming can only
//! clear bits and erasing sets them all.

use core::ops::BitOr;

/// Checks that every '1' bit is a '1' on the right hand side.
pub trait BitSubset: Copy {
    fn is_subset_of(self, rhs: Self) -> bool;
}

impl<U: Copy + BitOr<Output = Self> + PartialEq> BitSubset for U {
    fn is_subset_of(self, rhs: Self) -> bool { (self | rhs) == rhs }
}

/// Whether `data` can be programmed over `current` without an erase.
/// `current` must be at least as long as `data`.
pub fn programmable_over(data: &[u8], current: &[u8]) -> bool {
    data.len() <= current.len() && data.iter().zip(current).all(|(new, old)| new.is_subset_of(*old))
}

/// Whether every byte reads as erased.
pub fn is_erased(bytes: &[u8]) -> bool { bytes.iter().all(|b| *b == 0xFF) }

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn checks_bit_subsets() {
        assert!(0xAAu8.is_subset_of(0xFFu8));
        assert!(!0xFFFF_FFFF_u32.is_subset_of(0xAAAA_AAAA_u32));
        assert!(0b0101u8.is_subset_of(0b0111));
    }

    #[test]
    fn programmed_bytes_fit_only_over_erased_ones() {
        let record = [0x41u8, 0x45, 0x48, 0x52];
        let erased = [0xFFu8; 4];
        assert!(programmable_over(&record, &erased));
        assert!(!programmable_over(&erased, &record));
        assert!(programmable_over(&[0x40], &record));
        assert!(!programmable_over(&[0xFF, 0xFF], &[0xFF]));
        assert!(is_erased(&erased));
        assert!(!is_erased(&record));
    }
}
