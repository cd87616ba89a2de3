//! Staging memory for an uploaded firmware image.
use crate::{error::Error, utilities::memory::align_up};
use log::debug;

/// Zeroed buffer sized to the declared image length rounded up to
/// whole erase blocks.
pub struct StagingBuffer {
    bytes: Vec<u8>,
}

impl StagingBuffer {
    /// Reserves a fresh buffer. Fails instead of aborting when the
    /// memory isn't available or the size exceeds `limit`.
    pub fn allocate(length: u32, granularity: usize, limit: usize) -> Result<Self, Error> {
        if granularity == 0 {
            return Err(Error::Configuration("Staging granularity must be non-zero"));
        }
        let size = align_up(length as usize, granularity);
        if size > limit {
            return Err(Error::Allocation);
        }
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size).map_err(|_| Error::Allocation)?;
        bytes.resize(size, 0);
        debug!("Allocated {} byte staging buffer", size);
        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize { self.bytes.len() }
    pub fn is_empty(&self) -> bool { self.bytes.is_empty() }
    pub fn as_slice(&self) -> &[u8] { &self.bytes }

    /// Copies `data` in at `offset`. Writes that don't fit entirely are
    /// rejected without touching the buffer.
    pub fn write_chunk(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        let start = offset as usize;
        let end = start.checked_add(data.len()).ok_or(Error::ChunkOutOfRange)?;
        self.bytes.get_mut(start..end).ok_or(Error::ChunkOutOfRange)?.copy_from_slice(data);
        Ok(())
    }
}
