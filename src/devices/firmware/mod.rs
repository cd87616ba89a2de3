//! Firmware update session: staging, verification and commit of one
//! uploaded image.
use crate::error::Error;
use log::{debug, info, warn};

pub mod commit;
pub mod source;
pub mod staging;
pub mod verify;

use staging::StagingBuffer;

pub const DIGEST_LENGTH: usize = 32;

/// Parameters of one update, fixed for the lifetime of its session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub flash_offset: u32,
    pub length: u32,
    pub digest: [u8; DIGEST_LENGTH],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Competing consumers have been asked to release the flash.
    Prepared,
    /// Session started, staging memory not yet available.
    Sized,
    Uploading,
    Ready,
    Mismatched,
    Committing,
}

/// One update attempt. Replacing the session drops its staging buffer.
pub struct Session {
    id: u64,
    request: TransferRequest,
    buffer: Option<StagingBuffer>,
    phase: Phase,
}

impl Session {
    pub fn new(id: u64, request: TransferRequest) -> Self {
        Self { id, request, buffer: None, phase: Phase::Sized }
    }

    pub fn id(&self) -> u64 { self.id }
    pub fn request(&self) -> &TransferRequest { &self.request }
    pub fn phase(&self) -> Phase { self.phase }
    pub fn has_buffer(&self) -> bool { self.buffer.is_some() }

    pub fn attach(&mut self, buffer: StagingBuffer) {
        self.buffer = Some(buffer);
        self.phase = Phase::Uploading;
    }

    /// Stores a chunk. Any write invalidates an earlier verification.
    pub fn write_chunk(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        let buffer = self.buffer.as_mut().ok_or(Error::BufferNotReady)?;
        buffer.write_chunk(offset, data)?;
        self.phase = Phase::Uploading;
        Ok(())
    }

    pub fn end_upload(&mut self) -> Result<(), Error> {
        let buffer = self.buffer.as_ref().ok_or(Error::BufferNotReady)?;
        if verify::verify(buffer.as_slice(), self.request.length as usize, &self.request.digest) {
            info!("Firmware digest matched");
            self.phase = Phase::Ready;
            Ok(())
        } else {
            warn!("Firmware digest mismatch");
            self.phase = Phase::Mismatched;
            Err(Error::DigestMismatch)
        }
    }

    /// Hands the verified image over to a commit.
    pub fn take_verified(&mut self) -> Result<(TransferRequest, StagingBuffer), Error> {
        if self.phase != Phase::Ready || self.request.length == 0 {
            return Err(Error::FirmwareNotReady);
        }
        let buffer = self.buffer.take().ok_or(Error::FirmwareNotReady)?;
        debug!("Session {} handed over for commit", self.id);
        self.phase = Phase::Committing;
        Ok((self.request, buffer))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request_for(image: &[u8]) -> TransferRequest {
        TransferRequest { flash_offset: 0, length: image.len() as u32, digest: verify::digest(image) }
    }

    fn staged(image: &[u8]) -> Session {
        let mut session = Session::new(1, request_for(image));
        session.attach(StagingBuffer::allocate(image.len() as u32, kb!(4), mb!(1)).unwrap());
        session.write_chunk(0, image).unwrap();
        session
    }

    #[test]
    fn chunks_require_staging_memory() {
        let mut session = Session::new(1, request_for(&[1, 2, 3]));
        assert_eq!(session.write_chunk(0, &[1]), Err(Error::BufferNotReady));
        assert_eq!(session.end_upload(), Err(Error::BufferNotReady));
        assert_eq!(session.take_verified().err(), Some(Error::FirmwareNotReady));
    }

    #[test]
    fn verified_sessions_hand_over_their_buffer_once() {
        // Given
        let image = vec![0x42u8; 5000];
        let mut session = staged(&image);

        // When
        session.end_upload().unwrap();
        let (request, buffer) = session.take_verified().unwrap();

        // Then
        assert_eq!(request.length, 5000);
        assert_eq!(&buffer.as_slice()[..5000], &image[..]);
        assert_eq!(session.phase(), Phase::Committing);
        assert!(session.take_verified().is_err());
    }

    #[test]
    fn writes_after_verification_clear_readiness() {
        let image = vec![0x42u8; 100];
        let mut session = staged(&image);
        session.end_upload().unwrap();
        session.write_chunk(0, &[0x42]).unwrap();
        assert_eq!(session.take_verified().err(), Some(Error::FirmwareNotReady));
    }

    #[test]
    fn mismatched_sessions_stay_open_for_retry() {
        let image = vec![0x42u8; 100];
        let mut session = staged(&image);
        session.write_chunk(50, &[0]).unwrap();
        assert_eq!(session.end_upload(), Err(Error::DigestMismatch));
        assert_eq!(session.phase(), Phase::Mismatched);

        session.write_chunk(50, &[0x42]).unwrap();
        assert!(session.end_upload().is_ok());
    }
}
