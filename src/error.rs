//! Error type for the gadget firmware library as a whole.
//!
//! Errors fall into five families: media (missing or failing flash),
//! format (unusable configuration record), integrity (digest mismatch),
//! resource (staging memory) and protocol (a command arriving before
//! its prerequisites). None of them are fatal to the process: at the
//! HID boundary every error collapses into a [`Status`] byte.
use crate::{devices::protocol::Status, hal::flash::FlashError};
use std::{
    fmt::{self, Display, Formatter},
    io,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// A flash region the operation needs is absent or has an unexpected geometry.
    MediaMissing(&'static str),
    /// The flash driver failed an erase, program or read.
    Media(FlashError),
    /// A commit would run past the end of the flash device.
    WriteOutOfBounds,
    /// The stored configuration record can't be trusted.
    Format(&'static str),
    /// The staged image doesn't hash to the expected digest.
    DigestMismatch,
    /// Staging memory could not be reserved.
    Allocation,
    /// A chunk doesn't fit inside the staging buffer.
    ChunkOutOfRange,
    BufferNotReady,
    FirmwareNotReady,
    /// A commit is already in flight.
    Busy,
    Malformed(&'static str),
    Io(io::ErrorKind),
    Configuration(&'static str),
}

impl Error {
    /// Status byte reported to the host for this error.
    pub fn status(&self) -> Status {
        match self {
            Error::MediaMissing(_) => Status::MtdMissing,
            Error::Media(_) | Error::WriteOutOfBounds => Status::MtdError,
            Error::DigestMismatch => Status::HashMismatch,
            Error::Allocation | Error::ChunkOutOfRange => Status::InsufficientMemory,
            Error::BufferNotReady => Status::BufferNotReady,
            Error::Busy => Status::TestBusy,
            Error::FirmwareNotReady
            | Error::Format(_)
            | Error::Malformed(_)
            | Error::Io(_)
            | Error::Configuration(_) => Status::FwNotReady,
        }
    }
}

impl From<FlashError> for Error {
    fn from(error: FlashError) -> Self { Error::Media(error) }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self { Error::Io(error.kind()) }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::MediaMissing(what) => write!(f, "[MediaError] -> missing {}", what),
            Error::Media(error) => write!(f, "[MediaError] -> {}", error),
            Error::WriteOutOfBounds => write!(f, "[MediaError] -> write exceeds flash device"),
            Error::Format(text) => write!(f, "[FormatError] -> {}", text),
            Error::DigestMismatch => write!(f, "[IntegrityError] -> firmware digest mismatch"),
            Error::Allocation => write!(f, "[ResourceError] -> staging allocation failed"),
            Error::ChunkOutOfRange => write!(f, "[ResourceError] -> chunk outside staging buffer"),
            Error::BufferNotReady => write!(f, "[ProtocolError] -> staging buffer not ready"),
            Error::FirmwareNotReady => write!(f, "[ProtocolError] -> firmware not verified"),
            Error::Busy => write!(f, "[ProtocolError] -> update already in flight"),
            Error::Malformed(text) => write!(f, "[ProtocolError] -> malformed {}", text),
            Error::Io(kind) => write!(f, "[IoError] -> {:?}", kind),
            Error::Configuration(text) => write!(f, "[ConfigurationError] -> {}", text),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errors_collapse_into_host_status_bytes() {
        assert_eq!(Error::BufferNotReady.status() as u8, 0x01);
        assert_eq!(Error::DigestMismatch.status() as u8, 0x02);
        assert_eq!(Error::FirmwareNotReady.status() as u8, 0x03);
        assert_eq!(Error::MediaMissing("whole device").status() as u8, 0x04);
        assert_eq!(Error::Media(FlashError::EraseFailed).status() as u8, 0x05);
        assert_eq!(Error::Busy.status() as u8, 0x83);
        assert_eq!(Error::Allocation.status() as u8, 0xFF);
    }
}
