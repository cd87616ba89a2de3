//! Byte sources a commit can stream an image from.
use super::staging::StagingBuffer;
use crate::error::Error;
use byteorder::{ByteOrder, LittleEndian};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

pub trait ImageSource {
    /// Bytes available from the source.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool { self.len() == 0 }

    /// Fills `out` from `position`. Bytes past the end of the source
    /// read as zero.
    fn read_at(&mut self, position: usize, out: &mut [u8]) -> Result<(), Error>;

    /// Little endian word stored immediately before `boundary`.
    fn marker(&mut self, boundary: usize) -> Result<Option<u32>, Error> {
        if boundary < 4 {
            return Ok(None);
        }
        let mut word = [0u8; 4];
        self.read_at(boundary - 4, &mut word)?;
        Ok(Some(LittleEndian::read_u32(&word)))
    }
}

fn available(length: usize, position: usize, requested: usize) -> usize {
    length.saturating_sub(position).min(requested)
}

/// Image held in a verified staging buffer.
pub struct StagedImage {
    buffer: StagingBuffer,
}

impl StagedImage {
    pub fn new(buffer: StagingBuffer) -> Self { Self { buffer } }
}

impl ImageSource for StagedImage {
    fn len(&self) -> usize { self.buffer.len() }

    fn read_at(&mut self, position: usize, out: &mut [u8]) -> Result<(), Error> {
        let count = available(self.buffer.len(), position, out.len());
        if count > 0 {
            out[..count].copy_from_slice(&self.buffer.as_slice()[position..position + count]);
        }
        out[count..].iter_mut().for_each(|b| *b = 0);
        Ok(())
    }
}

/// Image read straight from a file on local storage.
pub struct FileImage {
    file: File,
    length: usize,
}

impl FileImage {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let length = u32::try_from(file.metadata()?.len())
            .map_err(|_| Error::Malformed("firmware file length"))?;
        if length == 0 {
            return Err(Error::Malformed("empty firmware file"));
        }
        Ok(Self { file, length: length as usize })
    }
}

impl ImageSource for FileImage {
    fn len(&self) -> usize { self.length }

    fn read_at(&mut self, position: usize, out: &mut [u8]) -> Result<(), Error> {
        let count = available(self.length, position, out.len());
        if count > 0 {
            self.file.seek(SeekFrom::Start(position as u64))?;
            self.file.read_exact(&mut out[..count])?;
        }
        out[count..].iter_mut().for_each(|b| *b = 0);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn staged_reads_past_the_end_are_zero_filled() {
        // Given
        let mut buffer = StagingBuffer::allocate(8, 8, 64).unwrap();
        buffer.write_chunk(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut image = StagedImage::new(buffer);
        let mut out = [0xEEu8; 6];

        // When
        image.read_at(5, &mut out).unwrap();

        // Then
        assert_eq!(out, [6, 7, 8, 0, 0, 0]);
    }

    #[test]
    fn file_images_report_markers_and_zero_fill() {
        // Given
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xAA; 12]).unwrap();
        file.write_all(&0x244A_3000u32.to_le_bytes()).unwrap();
        file.flush().unwrap();
        let mut image = FileImage::open(file.path()).unwrap();

        // Then
        assert_eq!(image.len(), 16);
        assert_eq!(image.marker(16).unwrap(), Some(0x244A_3000));
        assert_eq!(image.marker(2).unwrap(), None);
        let mut out = [0xEEu8; 4];
        image.read_at(14, &mut out).unwrap();
        assert_eq!(out, [0x4A, 0x24, 0, 0]);
        image.read_at(100, &mut out).unwrap();
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn empty_or_missing_files_are_refused() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(FileImage::open(file.path()).is_err());
        let missing = file.path().with_extension("missing");
        assert_eq!(FileImage::open(&missing).err(), Some(Error::Io(std::io::ErrorKind::NotFound)));
    }

    #[test]
    fn files_past_the_32_bit_address_space_are_refused() {
        // Given a sparse file one byte longer than any flash offset
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(u32::MAX as u64 + 1).unwrap();

        // When
        let result = FileImage::open(file.path());

        // Then
        assert!(matches!(result, Err(Error::Malformed(_))));
    }
}
