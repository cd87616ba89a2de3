//! Snapshot of the flash partition table.
use crate::{
    devices::protocol::SystemInfo,
    hal::flash::{FlashDevice, Partition, MAX_PARTITIONS},
    utilities::memory::Region,
};
use log::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    partitions: Vec<Partition>,
    flash_size: u32,
}

impl Topology {
    /// Enumerates the device's partitions. Offsets are recomputed as the
    /// running sum of the partition sizes.
    pub fn discover<D: FlashDevice + ?Sized>(device: &D) -> Self {
        let mut offset = 0u32;
        let partitions: Vec<Partition> = device
            .partitions()
            .into_iter()
            .take(MAX_PARTITIONS)
            .map(|partition| {
                let partition = Partition { offset, ..partition };
                offset = offset.saturating_add(partition.size);
                debug!(
                    "Partition {} offset {:#010X} size {:#010X} parent {:#010X}",
                    partition.index, partition.offset, partition.size, partition.parent_size
                );
                partition
            })
            .collect();
        let flash_size = partitions.first().map_or(0, |p| p.parent_size);
        Self { partitions, flash_size }
    }

    pub fn partitions(&self) -> &[Partition] { &self.partitions }
    pub fn flash_size(&self) -> u32 { self.flash_size }

    pub fn starting_at(&self, offset: u32) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.offset == offset)
    }

    pub fn containing(&self, address: usize) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.contains(address))
    }

    /// Start of the data partition, past the bootloader and configuration partitions.
    pub fn data_offset(&self) -> Option<u32> {
        self.partitions.get(1).map(|p| p.offset + p.size)
    }

    /// Start of the device tree blob, past the data partition.
    pub fn dtb_offset(&self) -> Option<u32> { self.partitions.get(2).map(|p| p.end()) }

    pub fn system_info(&self, chip_type: u8, uid: [u8; 8]) -> SystemInfo {
        SystemInfo {
            chip_type,
            flash_size: self.flash_size,
            uid,
            partitions: self.partitions.iter().map(|p| (p.offset, p.size)).collect(),
        }
    }
}
