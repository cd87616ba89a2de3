//! Flash device mirrored in a regular file.
//!
//! The file holds the whole flash image; partitions follow the
//! configured layout. Erased bytes read as 0xFF and, as on NOR
//! media, programming may only clear bits. Positional I/O lets
//! every partition view share the file without sharing a cursor.
use crate::{
    config::Layout,
    error::Error,
    hal::flash::{check_erase_range, check_range, Flash, FlashDevice, FlashError, FlashRegion, Partition},
    utilities::bitwise::programmable_over,
};
use log::{debug, warn};
use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
    sync::Arc,
};

const ERASE_CHUNK: usize = kb!(64);

pub struct ImageFile {
    file: Arc<File>,
    base: usize,
    size: usize,
    erase_size: usize,
}

impl Flash for ImageFile {
    fn read(&mut self, address: usize, bytes: &mut [u8]) -> nb::Result<(), FlashError> {
        check_range(address, bytes.len(), self.size)?;
        self.file.read_exact_at(bytes, (self.base + address) as u64).map_err(FlashError::from)?;
        Ok(())
    }

    fn erase(&mut self, address: usize, length: usize) -> nb::Result<(), FlashError> {
        check_erase_range(address, length, self.erase_size, self.size)?;
        let blank = [0xFFu8; ERASE_CHUNK];
        let start = self.base + address;
        let mut position = start;
        while position < start + length {
            let count = ERASE_CHUNK.min(start + length - position);
            self.file
                .write_all_at(&blank[..count], position as u64)
                .map_err(|_| nb::Error::Other(FlashError::EraseFailed))?;
            position += count;
        }
        Ok(())
    }

    fn program(&mut self, address: usize, bytes: &[u8]) -> nb::Result<usize, FlashError> {
        check_range(address, bytes.len(), self.size)?;
        let position = (self.base + address) as u64;
        let mut current = vec![0u8; bytes.len()];
        self.file.read_exact_at(&mut current, position).map_err(FlashError::from)?;
        if !programmable_over(bytes, &current) {
            return Err(nb::Error::Other(FlashError::NotErased));
        }
        self.file
            .write_all_at(bytes, position)
            .map_err(|_| nb::Error::Other(FlashError::ProgramFailed))?;
        Ok(bytes.len())
    }

    fn erase_size(&self) -> usize { self.erase_size }
    fn size(&self) -> usize { self.size }

    fn unlock(&mut self) {
        if let Err(e) = self.file.sync_data() {
            warn!("Failed to sync flash image: {}", e);
        }
    }
}

pub struct ImageFileDevice {
    partitions: Vec<Partition>,
    regions: Vec<FlashRegion<ImageFile>>,
    whole: FlashRegion<ImageFile>,
}

impl ImageFileDevice {
    /// Creates a blank (all 0xFF) image sized for `layout`, replacing
    /// any existing file.
    pub fn create(path: &Path, layout: &Layout, erase_size: u32) -> Result<Self, Error> {
        check_geometry(layout, erase_size)?;
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        file.set_len(layout.flash_size as u64)?;
        let device = Self::from_file(file, layout, erase_size)?;
        device.whole.exclusive(|flash| {
            let size = flash.size();
            nb::block!(flash.erase(0, size))
        })?;
        debug!("Created blank flash image {:?}", path);
        Ok(device)
    }

    /// Opens an existing image, which must match the layout's flash size.
    pub fn open(path: &Path, layout: &Layout, erase_size: u32) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() != layout.flash_size as u64 {
            return Err(Error::MediaMissing("flash image of the configured size"));
        }
        Self::from_file(file, layout, erase_size)
    }

    fn from_file(file: File, layout: &Layout, erase_size: u32) -> Result<Self, Error> {
        check_geometry(layout, erase_size)?;
        let file = Arc::new(file);
        let view = |base: u32, size: u32| {
            FlashRegion::new(ImageFile {
                file: Arc::clone(&file),
                base: base as usize,
                size: size as usize,
                erase_size: erase_size as usize,
            })
        };
        let partitions = Partition::sequence(&layout.partition_sizes(), erase_size, layout.flash_size);
        let regions = partitions.iter().map(|p| view(p.offset, p.size)).collect();
        let whole = view(0, layout.flash_size);
        Ok(Self { partitions, regions, whole })
    }
}

/// Every partition must start and end on an erase block boundary.
fn check_geometry(layout: &Layout, erase_size: u32) -> Result<(), Error> {
    if erase_size == 0 || layout.flash_size % erase_size != 0 {
        return Err(Error::Configuration("Flash size must be a whole number of erase blocks"));
    }
    if layout.dtb_offset().map_or(true, |end| end > layout.flash_size) {
        return Err(Error::Configuration("Fixed partitions exceed the flash size"));
    }
    if layout.partition_sizes().iter().any(|size| size % erase_size != 0) {
        return Err(Error::Configuration("Partitions must be aligned to the erase block size"));
    }
    Ok(())
}

impl FlashDevice for ImageFileDevice {
    type Flash = ImageFile;

    fn partitions(&self) -> Vec<Partition> { self.partitions.clone() }

    fn partition(&self, index: usize) -> Option<FlashRegion<ImageFile>> { self.regions.get(index).cloned() }

    fn whole(&self) -> Option<FlashRegion<ImageFile>> { Some(self.whole.clone()) }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::Settings,
        devices::eeprom::{ConfigStore, Provenance},
        hal::doubles::system::FakeRestart,
    };

    fn layout() -> Layout {
        Layout { bootloader_size: kb!(32), config_size: kb!(16), data_size: kb!(160), flash_size: kb!(256) }
    }

    #[test]
    fn created_images_are_blank_and_partitioned() {
        // Given
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("flash.bin");

        // When
        let device = ImageFileDevice::create(&path, &layout(), kb!(16)).unwrap();

        // Then
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xFFu8; kb!(256)]);
        let offsets: Vec<_> = device.partitions().iter().map(|p| (p.offset, p.size)).collect();
        assert_eq!(offsets, [(0, kb!(32)), (kb!(32), kb!(16)), (kb!(48), kb!(160)), (kb!(208), kb!(48))]);
    }

    #[test]
    fn partition_views_address_from_their_own_start() {
        // Given
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("flash.bin");
        let device = ImageFileDevice::create(&path, &layout(), kb!(16)).unwrap();
        let config = device.partition(1).unwrap();

        // When
        config.exclusive(|flash| nb::block!(flash.program(4, &[1, 2, 3]))).unwrap();

        // Then
        let reopened = ImageFileDevice::open(&path, &layout(), kb!(16)).unwrap();
        let mut bytes = [0u8; 5];
        reopened.whole().unwrap().exclusive(|flash| nb::block!(flash.read(kb!(32) + 3, &mut bytes))).unwrap();
        assert_eq!(bytes, [0xFF, 1, 2, 3, 0xFF]);
        assert_eq!(
            config.exclusive(|flash| nb::block!(flash.program(kb!(16), &[0]))),
            Err(FlashError::OutOfBounds)
        );
        assert_eq!(config.exclusive(|flash| nb::block!(flash.program(4, &[0xFF]))), Err(FlashError::NotErased));
    }

    #[test]
    fn mismatched_images_are_refused() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("flash.bin");
        std::fs::write(&path, [0u8; 16]).unwrap();
        assert!(ImageFileDevice::open(&path, &layout(), kb!(16)).is_err());
        assert!(ImageFileDevice::open(&directory.path().join("missing.bin"), &layout(), kb!(16)).is_err());
    }

    #[test]
    fn erase_blocks_larger_than_a_partition_are_refused() {
        // Given
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("flash.bin");

        // When
        let result = ImageFileDevice::create(&path, &layout(), kb!(64));

        // Then
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert!(!path.exists());
    }

    #[test]
    fn default_settings_round_trip_the_configuration_record() {
        // Given
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("flash.bin");
        let settings = Settings { persist_delay_ms: 60_000, ..Settings::default() };
        let device = ImageFileDevice::create(&path, &settings.layout, settings.erase_block_size).unwrap();
        let store = ConfigStore::open(&device, &settings, Arc::new(FakeRestart::default())).unwrap();

        // When
        store.mutate(|record| record.usb.hid_2_0 = 1);
        store.persist(false);
        store.flush();

        // Then
        assert_eq!(store.last_failure(), None);
        let reopened = ImageFileDevice::open(&path, &settings.layout, settings.erase_block_size).unwrap();
        let reloaded = ConfigStore::open(&reopened, &settings, Arc::new(FakeRestart::default())).unwrap();
        assert_eq!(reloaded.provenance(), Provenance::Current);
        assert_eq!(reloaded.record().usb.hid_2_0, 1);
    }
}
