//! Erase and program of a verified image onto the whole flash device.
//!
//! A [`CommitPlan`] decides where the image lands and how it is split
//! into transactions; [`execute`] then walks the transactions in
//! ascending address order, erasing each range before programming it
//! and stopping at the first failure.
use super::{source::ImageSource, TransferRequest};
use crate::{
    config::Settings,
    devices::topology::Topology,
    error::Error,
    hal::flash::{Flash, FlashError, FlashRegion},
    utilities::memory::blocks_spanned,
};
use log::{debug, info};

/// One bounded erase+program pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Absolute flash address.
    pub address: usize,
    pub source_offset: usize,
    pub length: usize,
    /// Progress reported once this transaction completes.
    pub progress: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitPlan {
    pub flash_offset: u32,
    pub source_offset: usize,
    pub blocks: usize,
    pub erase_size: usize,
    pub max_write_blocks: usize,
    /// Leading bytes skipped when a combined image is redirected.
    pub progress_base: u32,
    pub redirected: bool,
}

impl CommitPlan {
    /// Plans a commit of `request`, reading the build marker from
    /// `source` when the request looks like a combined image.
    pub fn build<S: ImageSource + ?Sized>(
        request: &TransferRequest,
        topology: &Topology,
        erase_size: usize,
        settings: &Settings,
        source: &mut S,
    ) -> Result<Self, Error> {
        if erase_size == 0 {
            return Err(Error::MediaMissing("erase geometry"));
        }
        let data_offset = topology.data_offset().ok_or(Error::MediaMissing("data partition"))?;
        let dtb_offset = topology.dtb_offset().ok_or(Error::MediaMissing("device tree partition"))?;

        let mut plan = Self {
            flash_offset: request.flash_offset,
            source_offset: 0,
            blocks: blocks_spanned(request.length as usize, erase_size),
            erase_size,
            max_write_blocks: (settings.max_write_blocks as usize).max(1),
            progress_base: 0,
            redirected: false,
        };

        let combined = request.flash_offset == 0
            && request.length > dtb_offset
            && settings.layout.data_offset() == Some(data_offset)
            && settings.layout.dtb_offset() == Some(dtb_offset);
        if combined && source.marker(data_offset as usize)? == Some(settings.rom_version) {
            info!("Combined image detected, updating kernel and rootfs only");
            plan.flash_offset = dtb_offset;
            plan.source_offset = dtb_offset as usize;
            plan.blocks = blocks_spanned((request.length - dtb_offset) as usize, erase_size);
            plan.progress_base = dtb_offset;
            plan.redirected = true;
        }

        match topology.starting_at(plan.flash_offset) {
            Some(partition) => debug!("Target is partition {} ({:#010X} bytes)", partition.index, partition.size),
            None => debug!("No partition starts at {:#010X}", plan.flash_offset),
        }

        let end = plan
            .blocks
            .checked_mul(erase_size)
            .and_then(|size| size.checked_add(plan.flash_offset as usize))
            .ok_or(Error::WriteOutOfBounds)?;
        if end > topology.flash_size() as usize {
            return Err(Error::WriteOutOfBounds);
        }

        debug!("Writing {} blocks to flash offset {:#010X}", plan.blocks, plan.flash_offset);
        Ok(plan)
    }

    pub fn total_bytes(&self) -> usize { self.blocks * self.erase_size }

    pub fn transactions(&self) -> impl Iterator<Item = Transaction> + '_ {
        (0..self.blocks).step_by(self.max_write_blocks).map(move |first| {
            let count = self.max_write_blocks.min(self.blocks - first);
            Transaction {
                address: self.flash_offset as usize + first * self.erase_size,
                source_offset: self.source_offset + first * self.erase_size,
                length: count * self.erase_size,
                progress: ((first + count) * self.erase_size) as u32 + self.progress_base,
            }
        })
    }
}

/// Runs every transaction of `plan` against `region`, reporting
/// progress after each one. The first failure aborts the commit.
pub fn execute<F: Flash, S: ImageSource + ?Sized>(
    plan: &CommitPlan,
    region: &FlashRegion<F>,
    source: &mut S,
    mut progress: impl FnMut(u32),
) -> Result<(), Error> {
    let capacity = plan.max_write_blocks.min(plan.blocks) * plan.erase_size;
    let mut transfer = Vec::new();
    transfer.try_reserve_exact(capacity).map_err(|_| Error::Allocation)?;
    transfer.resize(capacity, 0u8);
    info!("Committing {} bytes at {:#010X}", plan.total_bytes(), plan.flash_offset);

    for transaction in plan.transactions() {
        let bytes = &mut transfer[..transaction.length];
        source.read_at(transaction.source_offset, bytes)?;
        debug!("Erasing and programming {:#010X}+{:#X}", transaction.address, transaction.length);
        region.exclusive(|flash: &mut F| -> Result<(), Error> {
            nb::block!(flash.erase(transaction.address, transaction.length))?;
            let written = nb::block!(flash.program(transaction.address, bytes))?;
            if written != transaction.length {
                return Err(FlashError::ShortWrite.into());
            }
            Ok(())
        })?;
        progress(transaction.progress);
    }
    Ok(())
}
