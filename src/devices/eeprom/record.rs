//! Byte-exact configuration record layout and schema migration.
//!
//! All fields are little endian and packed without padding. Version 3
//! is current; version 2 stored the account block first and had no
//! custom server fields.
use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};
use nom::{
    bytes::complete::take,
    number::complete::{le_u32, u8},
    IResult,
};
use static_assertions::const_assert_eq;

pub const MAGIC: u32 = 0x5248_4541;
pub const CURRENT_VERSION: u32 = 3;
pub const LEGACY_VERSION: u32 = 2;

pub const UID_LENGTH: usize = 16;
pub const SERVER_LENGTH: usize = 422;
pub const EDID_LENGTH: usize = 256;

const HEADER_SIZE: usize = 8;
const USB_INFO_SIZE: usize = 61;
const EDID_INFO_SIZE: usize = 512;
const ACCOUNT_INFO_SIZE: usize = 440;
const LEGACY_ACCOUNT_INFO_SIZE: usize = 128;

pub const RECORD_SIZE: usize = HEADER_SIZE + USB_INFO_SIZE + EDID_INFO_SIZE + ACCOUNT_INFO_SIZE;
pub const LEGACY_RECORD_SIZE: usize =
    HEADER_SIZE + LEGACY_ACCOUNT_INFO_SIZE + USB_INFO_SIZE + EDID_INFO_SIZE;

const_assert_eq!(RECORD_SIZE, 1021);
const_assert_eq!(LEGACY_RECORD_SIZE, 709);

const USB_OFFSET: usize = HEADER_SIZE;
const EDID_OFFSET: usize = USB_OFFSET + USB_INFO_SIZE;
const ACCOUNT_OFFSET: usize = EDID_OFFSET + EDID_INFO_SIZE;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbInfo {
    pub hid_2_0: u8,
    pub reserved: [u8; 60],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EdidInfo {
    pub width: u32,
    pub height: u32,
    pub edid_used: u8,
    pub edid: [u8; EDID_LENGTH],
    pub reserved: [u8; 247],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AccountInfo {
    pub device_bound: u8,
    pub uid: [u8; UID_LENGTH],
    pub custom_cloud_server: u8,
    /// NUL padded server name.
    pub cloud_server: [u8; SERVER_LENGTH],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub magic: u32,
    pub version: u32,
    pub usb: UsbInfo,
    pub edid: EdidInfo,
    pub account: AccountInfo,
}

/// How a stored image was interpreted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Provenance {
    Current,
    Migrated { from: u32 },
    /// No valid magic; the device is unconfigured.
    Blank,
    Unsupported { version: u32 },
}

impl Default for Record {
    /// Valid but empty record of the current version.
    fn default() -> Self { Self { magic: MAGIC, version: CURRENT_VERSION, ..Self::zeroed() } }
}

impl Record {
    /// Every byte zero, magic included.
    pub fn zeroed() -> Self {
        Self {
            magic: 0,
            version: 0,
            usb: UsbInfo { hid_2_0: 0, reserved: [0; 60] },
            edid: EdidInfo { width: 0, height: 0, edid_used: 0, edid: [0; EDID_LENGTH], reserved: [0; 247] },
            account: AccountInfo {
                device_bound: 0,
                uid: [0; UID_LENGTH],
                custom_cloud_server: 0,
                cloud_server: [0; SERVER_LENGTH],
            },
        }
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut image = [0u8; RECORD_SIZE];
        LittleEndian::write_u32(&mut image[0..4], self.magic);
        LittleEndian::write_u32(&mut image[4..8], self.version);

        let usb = &mut image[USB_OFFSET..EDID_OFFSET];
        usb[0] = self.usb.hid_2_0;
        usb[1..].copy_from_slice(&self.usb.reserved);

        let edid = &mut image[EDID_OFFSET..ACCOUNT_OFFSET];
        LittleEndian::write_u32(&mut edid[0..4], self.edid.width);
        LittleEndian::write_u32(&mut edid[4..8], self.edid.height);
        edid[8] = self.edid.edid_used;
        edid[9..9 + EDID_LENGTH].copy_from_slice(&self.edid.edid);
        edid[9 + EDID_LENGTH..].copy_from_slice(&self.edid.reserved);

        let account = &mut image[ACCOUNT_OFFSET..];
        account[0] = self.account.device_bound;
        account[1..1 + UID_LENGTH].copy_from_slice(&self.account.uid);
        account[1 + UID_LENGTH] = self.account.custom_cloud_server;
        account[2 + UID_LENGTH..].copy_from_slice(&self.account.cloud_server);
        image
    }

    /// Interprets a stored image, migrating older schemas forward.
    pub fn decode(image: &[u8]) -> (Self, Provenance) {
        let (magic, version) = match header(image) {
            Ok((_, header)) => header,
            Err(_) => return (Self::default(), Provenance::Blank),
        };
        if magic != MAGIC {
            warn!("Bad configuration record magic {:#010X}", magic);
            return (Self::default(), Provenance::Blank);
        }
        match version {
            CURRENT_VERSION => match current(image) {
                Ok((_, record)) => (record, Provenance::Current),
                Err(_) => {
                    warn!("Truncated configuration record");
                    (Self::default(), Provenance::Blank)
                }
            },
            LEGACY_VERSION => match legacy(image) {
                Ok((_, record)) => {
                    info!("Migrating configuration record from version {} to {}", version, CURRENT_VERSION);
                    (record, Provenance::Migrated { from: version })
                }
                Err(_) => {
                    warn!("Truncated legacy configuration record");
                    (Self::default(), Provenance::Blank)
                }
            },
            _ => {
                warn!("Unsupported configuration record version {}, using defaults", version);
                (Self::default(), Provenance::Unsupported { version })
            }
        }
    }

    /// Server name up to the first NUL.
    pub fn cloud_server(&self) -> &[u8] {
        let server = &self.account.cloud_server;
        let end = server.iter().position(|b| *b == 0).unwrap_or(server.len());
        &server[..end]
    }
}

fn array<const N: usize>(input: &[u8]) -> IResult<&[u8], [u8; N]> {
    let (input, bytes) = take(N)(input)?;
    let mut array = [0u8; N];
    array.copy_from_slice(bytes);
    Ok((input, array))
}

fn header(input: &[u8]) -> IResult<&[u8], (u32, u32)> {
    let (input, magic) = le_u32(input)?;
    let (input, version) = le_u32(input)?;
    Ok((input, (magic, version)))
}

fn usb_info(input: &[u8]) -> IResult<&[u8], UsbInfo> {
    let (input, hid_2_0) = u8(input)?;
    let (input, reserved) = array(input)?;
    Ok((input, UsbInfo { hid_2_0, reserved }))
}

fn edid_info(input: &[u8]) -> IResult<&[u8], EdidInfo> {
    let (input, width) = le_u32(input)?;
    let (input, height) = le_u32(input)?;
    let (input, edid_used) = u8(input)?;
    let (input, edid) = array(input)?;
    let (input, reserved) = array(input)?;
    Ok((input, EdidInfo { width, height, edid_used, edid, reserved }))
}

fn account_info(input: &[u8]) -> IResult<&[u8], AccountInfo> {
    let (input, device_bound) = u8(input)?;
    let (input, uid) = array(input)?;
    let (input, custom_cloud_server) = u8(input)?;
    let (input, cloud_server) = array(input)?;
    Ok((input, AccountInfo { device_bound, uid, custom_cloud_server, cloud_server }))
}

fn current(input: &[u8]) -> IResult<&[u8], Record> {
    let (input, (magic, version)) = header(input)?;
    let (input, usb) = usb_info(input)?;
    let (input, edid) = edid_info(input)?;
    let (input, account) = account_info(input)?;
    Ok((input, Record { magic, version, usb, edid, account }))
}

/// Version 2 only knew the binding flag and uid; server fields start out empty.
fn legacy(input: &[u8]) -> IResult<&[u8], Record> {
    let (input, _) = header(input)?;
    let (input, device_bound) = u8(input)?;
    let (input, uid) = array::<UID_LENGTH>(input)?;
    let (input, _reserved) = take(LEGACY_ACCOUNT_INFO_SIZE - 1 - UID_LENGTH)(input)?;
    let (input, usb) = usb_info(input)?;
    let (input, edid) = edid_info(input)?;
    let mut record = Record { usb, edid, ..Record::default() };
    record.account.device_bound = device_bound;
    record.account.uid = uid;
    Ok((input, record))
}

#[cfg(test)]
mod test {
    use super::*;

    fn populated() -> Record {
        let mut record = Record::default();
        record.usb.hid_2_0 = 1;
        record.usb.reserved[59] = 0x5A;
        record.edid.width = 1920;
        record.edid.height = 1080;
        record.edid.edid_used = 1;
        record.edid.edid[0] = 0x00;
        record.edid.edid[1] = 0xFF;
        record.edid.reserved[246] = 0xA5;
        record.account.device_bound = 1;
        record.account.uid = [7; UID_LENGTH];
        record.account.custom_cloud_server = 1;
        record.account.cloud_server[..11].copy_from_slice(b"example.org");
        record
    }

    fn legacy_image(source: &Record) -> Vec<u8> {
        let mut image = vec![0u8; LEGACY_RECORD_SIZE];
        LittleEndian::write_u32(&mut image[0..4], MAGIC);
        LittleEndian::write_u32(&mut image[4..8], LEGACY_VERSION);
        image[8] = source.account.device_bound;
        image[9..25].copy_from_slice(&source.account.uid);
        image[25..136].iter_mut().for_each(|b| *b = 0xCC);
        let current = source.encode();
        image[136..136 + USB_INFO_SIZE].copy_from_slice(&current[USB_OFFSET..EDID_OFFSET]);
        image[197..].copy_from_slice(&current[EDID_OFFSET..ACCOUNT_OFFSET]);
        image
    }

    #[test]
    fn field_offsets_match_the_packed_layout() {
        let image = populated().encode();
        assert_eq!(&image[0..4], &[0x41, 0x45, 0x48, 0x52]);
        assert_eq!(image[4], 3);
        assert_eq!(image[8], 1);
        assert_eq!(LittleEndian::read_u32(&image[69..73]), 1920);
        assert_eq!(LittleEndian::read_u32(&image[73..77]), 1080);
        assert_eq!(image[581], 1);
        assert_eq!(&image[582..598], &[7; UID_LENGTH]);
        assert_eq!(image[598], 1);
        assert_eq!(&image[599..610], b"example.org");
    }

    #[test]
    fn current_records_round_trip_including_reserved_bytes() {
        let record = populated();
        assert_eq!(Record::decode(&record.encode()), (record, Provenance::Current));
    }

    #[test]
    fn legacy_records_migrate_known_fields_only() {
        // Given
        let source = populated();
        let image = legacy_image(&source);

        // When
        let (record, provenance) = Record::decode(&image);

        // Then
        assert_eq!(provenance, Provenance::Migrated { from: 2 });
        assert_eq!(record.version, CURRENT_VERSION);
        assert_eq!(record.usb, source.usb);
        assert_eq!(record.edid, source.edid);
        assert_eq!(record.account.device_bound, 1);
        assert_eq!(record.account.uid, source.account.uid);
        assert_eq!(record.account.custom_cloud_server, 0);
        assert!(record.cloud_server().is_empty());
    }

    #[test]
    fn foreign_and_unknown_images_fall_back_to_defaults() {
        let mut image = populated().encode();
        image[0] = 0;
        assert_eq!(Record::decode(&image), (Record::default(), Provenance::Blank));
        assert_eq!(Record::decode(&[0xFF; RECORD_SIZE]), (Record::default(), Provenance::Blank));
        assert_eq!(Record::decode(&[]), (Record::default(), Provenance::Blank));

        let mut image = populated().encode();
        image[4] = 4;
        assert_eq!(Record::decode(&image), (Record::default(), Provenance::Unsupported { version: 4 }));
        image[4] = 1;
        assert_eq!(Record::decode(&image), (Record::default(), Provenance::Unsupported { version: 1 }));
    }

    #[test]
    fn reset_records_are_all_zero() {
        assert!(Record::zeroed().encode().iter().all(|b| *b == 0));
        assert_eq!(Record::decode(&Record::zeroed().encode()).1, Provenance::Blank);
    }
}
