//! Flash media interfaces.
//!
//! A [`Flash`] is an erase-block granular read/erase/program device,
//! addressed from its own start. A [`FlashDevice`] enumerates the
//! partitions of a physical chip and hands out shareable
//! [`FlashRegion`] handles for a single partition or for the whole
//! parent device.
use crate::utilities::{
    guard::Guard,
    memory::Region,
};
use std::{
    fmt::{self, Display, Formatter},
    io,
    sync::{Arc, Mutex, PoisonError},
};

/// Upper bound on the partitions reported by a device.
pub const MAX_PARTITIONS: usize = 20;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlashError {
    OutOfBounds,
    /// Erase range not aligned to the erase block size.
    Misaligned,
    EraseFailed,
    ProgramFailed,
    ReadFailed,
    /// Programming would need to set bits that aren't erased.
    NotErased,
    ShortWrite,
    Io(io::ErrorKind),
}

impl Display for FlashError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::OutOfBounds => write!(f, "flash access out of bounds"),
            FlashError::Misaligned => write!(f, "flash erase misaligned"),
            FlashError::EraseFailed => write!(f, "flash erase failed"),
            FlashError::ProgramFailed => write!(f, "flash program failed"),
            FlashError::ReadFailed => write!(f, "flash read failed"),
            FlashError::NotErased => write!(f, "flash programmed over non-erased bits"),
            FlashError::ShortWrite => write!(f, "flash program wrote fewer bytes than requested"),
            FlashError::Io(kind) => write!(f, "flash I/O error ({:?})", kind),
        }
    }
}

impl From<io::Error> for FlashError {
    fn from(error: io::Error) -> Self { FlashError::Io(error.kind()) }
}

/// Erase-block granular flash media.
pub trait Flash {
    fn read(&mut self, address: usize, bytes: &mut [u8]) -> nb::Result<(), FlashError>;
    /// Erases `length` bytes at `address`. Both must be multiples of [`Flash::erase_size`].
    fn erase(&mut self, address: usize, length: usize) -> nb::Result<(), FlashError>;
    /// Programs previously erased memory, returning the number of bytes written.
    fn program(&mut self, address: usize, bytes: &[u8]) -> nb::Result<usize, FlashError>;
    fn erase_size(&self) -> usize;
    fn size(&self) -> usize;
    /// Hook run when a caller takes exclusive ownership of the region.
    fn lock(&mut self) {}
    /// Hook run when exclusive ownership is released.
    fn unlock(&mut self) {}
}

/// Checks that `[address, address + length)` lies inside a device of `size` bytes.
pub fn check_range(address: usize, length: usize, size: usize) -> Result<(), FlashError> {
    match address.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(FlashError::OutOfBounds),
    }
}

/// Checks an erase request against the device geometry.
pub fn check_erase_range(
    address: usize,
    length: usize,
    erase_size: usize,
    size: usize,
) -> Result<(), FlashError> {
    if erase_size == 0 || address % erase_size != 0 || length % erase_size != 0 {
        return Err(FlashError::Misaligned);
    }
    check_range(address, length, size)
}

/// Shareable handle to a flash region. All access goes through
/// [`FlashRegion::exclusive`], which serializes callers and brackets
/// the device lock hooks.
pub struct FlashRegion<F> {
    flash: Arc<Mutex<F>>,
}

impl<F> Clone for FlashRegion<F> {
    fn clone(&self) -> Self { Self { flash: Arc::clone(&self.flash) } }
}

impl<F: Flash> FlashRegion<F> {
    pub fn new(flash: F) -> Self { Self { flash: Arc::new(Mutex::new(flash)) } }

    /// Runs `operation` with exclusive access to the region. The region is
    /// unlocked on every exit path, failures included.
    pub fn exclusive<R>(&self, operation: impl FnOnce(&mut F) -> R) -> R {
        let mut held = self.flash.lock().unwrap_or_else(PoisonError::into_inner);
        let mut guard = Guard::new(&mut *held, F::lock, F::unlock);
        operation(&mut *guard)
    }

    pub fn erase_size(&self) -> usize {
        self.flash.lock().unwrap_or_else(PoisonError::into_inner).erase_size()
    }

    pub fn size(&self) -> usize { self.flash.lock().unwrap_or_else(PoisonError::into_inner).size() }
}

/// One entry of a device's partition table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub index: u8,
    /// Offset of the partition from the start of the parent device.
    pub offset: u32,
    pub size: u32,
    pub erase_size: u32,
    /// Size of the whole parent device.
    pub parent_size: u32,
}

impl Partition {
    /// Lays out consecutive partitions of the given sizes from offset zero.
    pub fn sequence(sizes: &[u32], erase_size: u32, parent_size: u32) -> Vec<Partition> {
        sizes
            .iter()
            .take(MAX_PARTITIONS)
            .enumerate()
            .scan(0u32, |offset, (index, size)| {
                let partition = Partition {
                    index: index as u8,
                    offset: *offset,
                    size: *size,
                    erase_size,
                    parent_size,
                };
                *offset = offset.saturating_add(*size);
                Some(partition)
            })
            .collect()
    }

    pub fn end(&self) -> u32 { self.offset.saturating_add(self.size) }
}

impl Region<usize> for Partition {
    fn contains(&self, address: usize) -> bool {
        (self.offset as usize) <= address && address < self.end() as usize
    }
}

/// Physical flash chip carved into partitions.
pub trait FlashDevice: Send + Sync + 'static {
    type Flash: Flash + Send + 'static;

    /// Partition table, in ascending offset order.
    fn partitions(&self) -> Vec<Partition>;
    /// Region covering a single partition, addressed from the partition start.
    fn partition(&self, index: usize) -> Option<FlashRegion<Self::Flash>>;
    /// Region covering the whole parent device.
    fn whole(&self) -> Option<FlashRegion<Self::Flash>>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partitions_are_laid_out_consecutively() {
        let partitions = Partition::sequence(&[kb!(32), kb!(16), kb!(160)], kb!(64), mb!(16));
        assert_eq!(partitions.len(), 3);
        assert_eq!(partitions[1].offset, kb!(32));
        assert_eq!(partitions[2].offset, kb!(48));
        assert_eq!(partitions[2].end(), kb!(208));
        assert!(partitions[1].contains(kb!(32) as usize));
        assert!(!partitions[1].contains(kb!(48) as usize));
    }

    #[test]
    fn erase_ranges_must_follow_geometry() {
        assert_eq!(check_erase_range(0, kb!(64), kb!(64), kb!(128)), Ok(()));
        assert_eq!(check_erase_range(kb!(4), kb!(64), kb!(64), kb!(128)), Err(FlashError::Misaligned));
        assert_eq!(check_erase_range(0, kb!(192), kb!(64), kb!(128)), Err(FlashError::OutOfBounds));
        assert_eq!(check_range(usize::MAX, 2, kb!(128)), Err(FlashError::OutOfBounds));
    }
}
