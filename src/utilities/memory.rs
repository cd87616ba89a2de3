//! Utilities to manipulate generic memory
#![macro_use]

#[macro_export]
macro_rules! kb {
    ($val:expr) => {
        $val * 1024
    };
}
#[macro_export]
macro_rules! mb {
    ($val:expr) => {
        $val * 1024 * 1024
    };
}

/// Generic address for the purpose of this module's methods.
/// Anything that can be offset by a usize and yield another
/// address works as an address.
pub trait Address: Copy + PartialOrd + core::ops::Add<usize, Output = Self> {}
impl<A> Address for A where A: Copy + PartialOrd + core::ops::Add<usize, Output = A> {}

/// Abstract region that can contain addresses
pub trait Region<A: Address> {
    fn contains(&self, address: A) -> bool;
}

/// Rounds `size` up to the next multiple of `granularity`.
pub fn align_up(size: usize, granularity: usize) -> usize {
    blocks_spanned(size, granularity) * granularity
}

/// Number of `granularity` sized blocks needed to hold `size` bytes.
pub fn blocks_spanned(size: usize, granularity: usize) -> usize {
    if granularity == 0 {
        0
    } else {
        (size + granularity - 1) / granularity
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn conversion_macros() {
        assert_eq!(kb!(16), 0x4000);
        assert_eq!(mb!(1), 0x100000);
    }

    #[test]
    fn sizes_round_up_to_whole_blocks() {
        assert_eq!(align_up(130_000, kb!(64)), 131_072);
        assert_eq!(blocks_spanned(130_000, kb!(64)), 2);
        assert_eq!(align_up(kb!(64), kb!(64)), kb!(64));
        assert_eq!(align_up(0, kb!(64)), 0);
        assert_eq!(blocks_spanned(1, kb!(4)), 1);
    }
}
