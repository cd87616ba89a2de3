//! Runtime settings.
//!
//! Every knob has a default matching the shipping gadget, so an empty
//! RON document (or no document at all) yields a working configuration.
use crate::{devices::eeprom::record::RECORD_SIZE, error::Error, utilities::memory::align_up};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Sizes of the fixed leading partitions of the flash device.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Layout {
    pub bootloader_size: u32,
    /// Partition holding the configuration record.
    pub config_size: u32,
    /// Partition holding the device tree blob.
    pub data_size: u32,
    pub flash_size: u32,
}

impl Default for Layout {
    fn default() -> Self {
        Self { bootloader_size: kb!(32), config_size: kb!(16), data_size: kb!(160), flash_size: mb!(16) }
    }
}

impl Layout {
    /// `None` when the leading partitions overflow the address space.
    pub fn data_offset(&self) -> Option<u32> { self.bootloader_size.checked_add(self.config_size) }
    pub fn dtb_offset(&self) -> Option<u32> { self.data_offset()?.checked_add(self.data_size) }

    /// Partition sizes in device order; whatever follows the data
    /// partition forms one trailing partition.
    pub fn partition_sizes(&self) -> Vec<u32> {
        let mut sizes = vec![self.bootloader_size, self.config_size, self.data_size];
        let rest = self.dtb_offset().map_or(0, |end| self.flash_size.saturating_sub(end));
        if rest > 0 {
            sizes.push(rest);
        }
        sizes
    }
}

/// Randomized sleep interval, bounds inclusive.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct SettleRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl SettleRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self { Self { min_ms, max_ms } }

    pub fn pick(&self) -> Duration {
        let span = self.max_ms.saturating_sub(self.min_ms);
        if span == 0 {
            return Duration::from_millis(self.min_ms);
        }
        let mut seed = [0u8; 8];
        let jitter = match getrandom::getrandom(&mut seed) {
            Ok(()) => u64::from_le_bytes(seed) % (span + 1),
            Err(_) => 0,
        };
        Duration::from_millis(self.min_ms + jitter)
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct LedPins {
    pub red: u32,
    pub green: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub debug_logging: bool,
    pub layout: Layout,
    /// Offset of the configuration record inside its partition.
    pub record_offset: u32,
    /// Granularity used when the flash device can't report its own.
    pub erase_block_size: u32,
    pub max_write_blocks: u32,
    /// Build marker stored little endian just before the data partition.
    pub rom_version: u32,
    pub persist_delay_ms: u64,
    pub record_settle: SettleRange,
    pub commit_settle: SettleRange,
    pub consumer_settle: SettleRange,
    pub indicator_period_ms: u64,
    pub firmware_file: PathBuf,
    pub consumer_prefix: String,
    pub build_version: String,
    pub max_staging_bytes: usize,
    /// Sixteen hex digits.
    pub device_serial: Option<String>,
    pub leds: Option<LedPins>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug_logging: false,
            layout: Layout::default(),
            record_offset: 0,
            erase_block_size: kb!(4),
            max_write_blocks: 64,
            rom_version: 0x244A_3000,
            persist_delay_ms: 1000,
            record_settle: SettleRange::new(500, 800),
            commit_settle: SettleRange::new(200, 300),
            consumer_settle: SettleRange::new(500, 1000),
            indicator_period_ms: 300,
            firmware_file: PathBuf::from("/tmp/fw.bin"),
            consumer_prefix: "qs".into(),
            build_version: env!("CARGO_PKG_VERSION").into(),
            max_staging_bytes: mb!(32),
            device_serial: None,
            leds: Some(LedPins { red: 139, green: 140 }),
        }
    }
}

impl Settings {
    pub fn from_ron(text: &str) -> Result<Self, Error> {
        let settings: Settings =
            ron::de::from_str(text).map_err(|_| Error::Configuration("Malformed settings document"))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.erase_block_size == 0 {
            return Err(Error::Configuration("Erase block size must be non-zero"));
        }
        if self.max_write_blocks == 0 {
            return Err(Error::Configuration("Write transactions must span at least one block"));
        }
        let ranges = [self.record_settle, self.commit_settle, self.consumer_settle];
        if ranges.iter().any(|r| r.min_ms > r.max_ms) {
            return Err(Error::Configuration("Settle range minimum exceeds its maximum"));
        }
        match self.layout.dtb_offset() {
            None => return Err(Error::Configuration("Fixed partitions overflow the address space")),
            Some(end) if end > self.layout.flash_size => {
                return Err(Error::Configuration("Fixed partitions exceed the flash size"))
            }
            Some(_) => {}
        }
        let Layout { bootloader_size, config_size, data_size, flash_size } = self.layout;
        let boundaries = [bootloader_size, config_size, data_size, flash_size, self.record_offset];
        if boundaries.iter().any(|b| b % self.erase_block_size != 0) {
            return Err(Error::Configuration("Partitions must be aligned to the erase block size"));
        }
        let record_span = align_up(RECORD_SIZE, self.erase_block_size as usize);
        let record_end = (self.record_offset as usize).checked_add(record_span);
        if record_end.map_or(true, |end| end > config_size as usize) {
            return Err(Error::Configuration("Configuration record doesn't fit its partition"));
        }
        Ok(())
    }

    pub fn persist_delay(&self) -> Duration { Duration::from_millis(self.persist_delay_ms) }
    pub fn indicator_period(&self) -> Duration { Duration::from_millis(self.indicator_period_ms) }

    /// Parsed device serial, all zeroes when absent or malformed.
    pub fn serial_number(&self) -> [u8; 8] {
        let mut serial = [0u8; 8];
        let text = match &self.device_serial {
            Some(text) if text.len() == 16 && text.is_ascii() => text,
            Some(_) => {
                warn!("Ignoring malformed device serial");
                return serial;
            }
            None => return serial,
        };
        for (i, byte) in serial.iter_mut().enumerate() {
            match u8::from_str_radix(&text[2 * i..2 * i + 2], 16) {
                Ok(value) => *byte = value,
                Err(_) => {
                    warn!("Ignoring malformed device serial");
                    return [0u8; 8];
                }
            }
        }
        serial
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_the_shipping_layout() {
        let settings = Settings::default();
        assert_eq!(settings.layout.data_offset(), Some(kb!(48)));
        assert_eq!(settings.layout.dtb_offset(), Some(kb!(208)));
        assert_eq!(settings.layout.partition_sizes(), [kb!(32), kb!(16), kb!(160), mb!(16) - kb!(208)]);
        assert_eq!(settings.rom_version, 608_841_728);
        assert_eq!(settings.max_write_blocks, 64);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn partial_documents_keep_remaining_defaults() {
        // Given
        let text = "(debug_logging: true, max_write_blocks: 8, device_serial: Some(\"0123456789abcdef\"))";

        // When
        let settings = Settings::from_ron(text).unwrap();

        // Then
        assert!(settings.debug_logging);
        assert_eq!(settings.max_write_blocks, 8);
        assert_eq!(settings.erase_block_size, kb!(4));
        assert_eq!(settings.serial_number(), [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF]);
    }

    #[test]
    fn invalid_documents_are_rejected() {
        assert!(Settings::from_ron("(max_write_blocks: 0)").is_err());
        assert!(Settings::from_ron("(commit_settle: (min_ms: 5, max_ms: 1))").is_err());
        assert!(Settings::from_ron("not ron at all").is_err());
    }

    #[test]
    fn overflowing_layouts_are_rejected() {
        // Given
        let text = "(layout: (data_size: 4294967295))";

        // When
        let result = Settings::from_ron(text);

        // Then
        assert!(matches!(result, Err(Error::Configuration(_))));
        let layout = Layout { data_size: u32::MAX, ..Layout::default() };
        assert_eq!(layout.dtb_offset(), None);
        assert_eq!(layout.partition_sizes(), [kb!(32), kb!(16), u32::MAX]);
    }

    #[test]
    fn partitions_must_be_aligned_to_the_erase_block() {
        // Given
        let too_coarse = "(erase_block_size: 65536)";
        let odd_record = "(record_offset: 100)";
        let record_past_partition = "(record_offset: 16384)";

        // Then
        assert!(matches!(Settings::from_ron(too_coarse), Err(Error::Configuration(_))));
        assert!(matches!(Settings::from_ron(odd_record), Err(Error::Configuration(_))));
        assert!(matches!(Settings::from_ron(record_past_partition), Err(Error::Configuration(_))));
        assert!(Settings::from_ron("(erase_block_size: 16384)").is_ok());
    }

    #[test]
    fn settle_intervals_stay_within_bounds() {
        let range = SettleRange::new(200, 300);
        for _ in 0..32 {
            let picked = range.pick();
            assert!(picked >= Duration::from_millis(200) && picked <= Duration::from_millis(300));
        }
        assert_eq!(SettleRange::new(0, 0).pick(), Duration::ZERO);
    }
}
