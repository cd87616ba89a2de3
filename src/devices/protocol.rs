//! Vendor HID report framing.
//!
//! Requests are decoded from the raw report bytes with explicit
//! offsets and byte order; replies are encoded into a fixed size
//! report buffer that is zeroed and re-tagged for every request.
use crate::{
    devices::firmware::{TransferRequest, DIGEST_LENGTH},
    error::Error,
    hal::flash::MAX_PARTITIONS,
};
use byteorder::{LittleEndian, WriteBytesExt};
use nom::{
    bytes::complete::{tag, take},
    combinator::rest,
    number::complete::{le_u32, u8},
    IResult,
};
use std::io::Write;

pub const REPORT_ID: u8 = 0x0C;
pub const REPORT_LENGTH: usize = 256;
pub const MAX_VERSION_LENGTH: usize = 64;

const STATUS_INDEX: usize = 2;
const PAYLOAD_INDEX: usize = 3;

/// Status byte placed at index 2 of every reply.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Ok = 0x00,
    BufferNotReady = 0x01,
    HashMismatch = 0x02,
    FwNotReady = 0x03,
    MtdMissing = 0x04,
    MtdError = 0x05,
    Updated = 0x4F,
    TestBusy = 0x83,
    InsufficientMemory = 0xFF,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    QueryStatus = 0xF0,
    Reboot = 0xF1,
    PrepareStage1 = 0xA0,
    PrepareStage2 = 0xA1,
    UploadFirmware = 0xA2,
    EndUploadFirmware = 0xA3,
    UpdateFirmware = 0xA4,
    GetUpdateProgress = 0xA5,
    GetFwVersion = 0xC2,
}

impl Command {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0xF0 => Command::QueryStatus,
            0xF1 => Command::Reboot,
            0xA0 => Command::PrepareStage1,
            0xA1 => Command::PrepareStage2,
            0xA2 => Command::UploadFirmware,
            0xA3 => Command::EndUploadFirmware,
            0xA4 => Command::UpdateFirmware,
            0xA5 => Command::GetUpdateProgress,
            0xC2 => Command::GetFwVersion,
            _ => return None,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Request<'a> {
    QueryStatus,
    Reboot,
    PrepareStage1,
    PrepareStage2(TransferRequest),
    Upload { offset: u32, data: &'a [u8] },
    EndUpload { offset: u32 },
    UpdateFirmware,
    GetUpdateProgress,
    GetFwVersion,
    Unknown(u8),
}

/// Splits a report into its command code and payload. Reports carrying
/// another id, or too short to hold a command, yield an error and get
/// no reply.
pub fn parse_header(input: &[u8]) -> IResult<&[u8], u8> {
    let (input, _) = tag(&[REPORT_ID][..])(input)?;
    u8(input)
}

pub fn parse_request(command: u8, payload: &[u8]) -> Result<Request<'_>, Error> {
    let parsed = match Command::from_code(command) {
        Some(Command::PrepareStage2) => parse_transfer_request(payload),
        Some(Command::UploadFirmware) => parse_upload(payload),
        Some(Command::EndUploadFirmware) => parse_end_upload(payload),
        Some(Command::QueryStatus) => Ok((payload, Request::QueryStatus)),
        Some(Command::Reboot) => Ok((payload, Request::Reboot)),
        Some(Command::PrepareStage1) => Ok((payload, Request::PrepareStage1)),
        Some(Command::UpdateFirmware) => Ok((payload, Request::UpdateFirmware)),
        Some(Command::GetUpdateProgress) => Ok((payload, Request::GetUpdateProgress)),
        Some(Command::GetFwVersion) => Ok((payload, Request::GetFwVersion)),
        None => Ok((payload, Request::Unknown(command))),
    };
    parsed.map(|(_, request)| request).map_err(|_| Error::Malformed("report payload"))
}

fn parse_transfer_request(input: &[u8]) -> IResult<&[u8], Request<'_>> {
    let (input, flash_offset) = le_u32(input)?;
    let (input, length) = le_u32(input)?;
    let (input, digest) = take(DIGEST_LENGTH)(input)?;
    let digest: [u8; DIGEST_LENGTH] = digest.try_into().unwrap_or([0; DIGEST_LENGTH]);
    Ok((input, Request::PrepareStage2(TransferRequest { flash_offset, length, digest })))
}

fn parse_upload(input: &[u8]) -> IResult<&[u8], Request<'_>> {
    let (input, offset) = le_u32(input)?;
    let (input, data) = rest(input)?;
    Ok((input, Request::Upload { offset, data }))
}

fn parse_end_upload(input: &[u8]) -> IResult<&[u8], Request<'_>> {
    let (input, offset) = le_u32(input)?;
    Ok((input, Request::EndUpload { offset }))
}

/// Fixed size reply report.
#[derive(Clone)]
pub struct Reply {
    buffer: [u8; REPORT_LENGTH],
}

impl Reply {
    pub fn new(command: u8) -> Self {
        let mut buffer = [0u8; REPORT_LENGTH];
        buffer[0] = REPORT_ID;
        buffer[1] = command;
        Self { buffer }
    }

    pub fn with_status(command: u8, status: Status) -> Self {
        let mut reply = Self::new(command);
        reply.set_status(status);
        reply
    }

    pub fn set_status(&mut self, status: Status) { self.buffer[STATUS_INDEX] = status as u8 }
    pub fn status(&self) -> u8 { self.buffer[STATUS_INDEX] }
    pub fn command(&self) -> u8 { self.buffer[1] }
    pub fn payload(&self) -> &[u8] { &self.buffer[PAYLOAD_INDEX..] }
    pub fn payload_mut(&mut self) -> &mut [u8] { &mut self.buffer[PAYLOAD_INDEX..] }
    pub fn as_bytes(&self) -> &[u8] { &self.buffer }

    pub fn write_progress(&mut self, progress: u32) -> Result<(), Error> {
        let mut cursor = self.payload_mut();
        cursor.write_u32::<LittleEndian>(progress)?;
        Ok(())
    }

    /// Writes a NUL padded version string, truncated to fit.
    pub fn write_version(&mut self, version: &str) {
        let bytes = version.as_bytes();
        let length = bytes.len().min(MAX_VERSION_LENGTH - 1);
        self.payload_mut()[..length].copy_from_slice(&bytes[..length]);
    }
}

impl core::fmt::Debug for Reply {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Reply {{ command: {:#04X}, status: {:#04X} }}", self.command(), self.status())
    }
}

/// Device and flash description returned by `QueryStatus`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemInfo {
    pub chip_type: u8,
    pub flash_size: u32,
    pub uid: [u8; 8],
    /// `(offset, size)` pairs.
    pub partitions: Vec<(u32, u32)>,
}

impl SystemInfo {
    /// Large-memory bit for parts above 70000 KiB, merged with the family
    /// bit. Both occupy bit 0, so shipping devices always report 0x01 and
    /// host tools rely on that byte.
    pub fn chip_type(memory_kb: u64) -> u8 {
        const FAMILY: u8 = 0x01;
        u8::from(memory_kb > 70_000) | FAMILY
    }

    pub fn encode(&self, mut out: &mut [u8]) -> Result<(), Error> {
        let count = self.partitions.len().min(MAX_PARTITIONS);
        out.write_u8(self.chip_type)?;
        out.write_u32::<LittleEndian>(self.flash_size)?;
        out.write_all(&self.uid)?;
        out.write_u8(count as u8)?;
        for (offset, size) in self.partitions.iter().take(count) {
            out.write_u32::<LittleEndian>(*offset)?;
            out.write_u32::<LittleEndian>(*size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use byteorder::ByteOrder;

    fn report(command: u8, payload: &[u8]) -> Vec<u8> {
        let mut report = vec![REPORT_ID, command];
        report.extend_from_slice(payload);
        report
    }

    #[test]
    fn parsing_stage_two_request() {
        // Given
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x3_4000u32.to_le_bytes());
        payload.extend_from_slice(&130_000u32.to_le_bytes());
        payload.extend_from_slice(&[0xAB; DIGEST_LENGTH]);
        let input = report(0xA1, &payload);

        // When
        let (payload, command) = parse_header(&input).unwrap();
        let request = parse_request(command, payload).unwrap();

        // Then
        assert_eq!(
            request,
            Request::PrepareStage2(TransferRequest {
                flash_offset: 0x3_4000,
                length: 130_000,
                digest: [0xAB; DIGEST_LENGTH],
            })
        );
    }

    #[test]
    fn parsing_upload_keeps_the_rest_of_the_report_as_data() {
        let input = report(0xA2, &[0x10, 0x00, 0x00, 0x00, 1, 2, 3]);
        let (payload, command) = parse_header(&input).unwrap();
        assert_eq!(parse_request(command, payload).unwrap(), Request::Upload { offset: 16, data: &[1, 2, 3] });
    }

    #[test]
    fn foreign_and_truncated_reports_are_rejected() {
        assert!(parse_header(&[0x05, 0xF0]).is_err());
        assert!(parse_header(&[REPORT_ID]).is_err());
        assert!(parse_header(&[]).is_err());
        assert_eq!(parse_request(0xA1, &[0; 12]), Err(Error::Malformed("report payload")));
        assert_eq!(parse_request(0x42, &[]), Ok(Request::Unknown(0x42)));
    }

    #[test]
    fn system_info_layout() {
        // Given
        let info = SystemInfo {
            chip_type: SystemInfo::chip_type(120_000),
            flash_size: mb!(16),
            uid: [1, 2, 3, 4, 5, 6, 7, 8],
            partitions: vec![(0, kb!(32)), (kb!(32), kb!(16))],
        };
        let mut reply = Reply::new(Command::QueryStatus as u8);

        // When
        info.encode(reply.payload_mut()).unwrap();

        // Then
        let bytes = reply.as_bytes();
        assert_eq!(&bytes[..3], &[REPORT_ID, 0xF0, 0x00]);
        assert_eq!(bytes[3], 0x01);
        assert_eq!(LittleEndian::read_u32(&bytes[4..8]), mb!(16));
        assert_eq!(&bytes[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bytes[16], 2);
        assert_eq!(LittleEndian::read_u32(&bytes[25..29]), kb!(32));
        assert_eq!(LittleEndian::read_u32(&bytes[29..33]), kb!(16));
    }

    #[test]
    fn chip_type_byte_is_the_same_for_every_memory_size() {
        // Given
        let sizes = [0, 65_536, 70_000, 70_001, 131_072];

        // When
        let types: Vec<u8> = sizes.iter().map(|kb| SystemInfo::chip_type(*kb)).collect();

        // Then
        assert_eq!(types, [0x01; 5]);
    }

    #[test]
    fn version_strings_are_nul_padded_and_truncated() {
        let mut reply = Reply::new(Command::GetFwVersion as u8);
        reply.write_version(&"x".repeat(100));
        assert_eq!(reply.payload()[MAX_VERSION_LENGTH - 2], b'x');
        assert_eq!(reply.payload()[MAX_VERSION_LENGTH - 1], 0);
    }
}
