//! Integrity check of staged images.
use super::DIGEST_LENGTH;
use log::debug;
use sha2::{Digest, Sha256};

const DIGEST_CHUNK: usize = kb!(64);

/// SHA-256 over `data`, fed in fixed size chunks.
pub fn digest(data: &[u8]) -> [u8; DIGEST_LENGTH] {
    let mut hasher = Sha256::new();
    data.chunks(DIGEST_CHUNK).for_each(|chunk| hasher.update(chunk));
    let mut digest = [0u8; DIGEST_LENGTH];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Checks the first `length` bytes of `buffer` against `expected`. The
/// comparison always inspects every byte.
pub fn verify(buffer: &[u8], length: usize, expected: &[u8; DIGEST_LENGTH]) -> bool {
    let data = match buffer.get(..length) {
        Some(data) => data,
        None => return false,
    };
    let actual = digest(data);
    let matched = actual.iter().zip(expected.iter()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0;
    if !matched {
        debug!("Digest mismatch, got {:02X?} expected {:02X?}", actual, expected);
    }
    matched
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_digest() {
        let expected = [
            0xBA, 0x78, 0x16, 0xBF, 0x8F, 0x01, 0xCF, 0xEA, 0x41, 0x41, 0x40, 0xDE, 0x5D, 0xAE, 0x22,
            0x23, 0xB0, 0x03, 0x61, 0xA3, 0x96, 0x17, 0x7A, 0x9C, 0xB4, 0x10, 0xFF, 0x61, 0xF2, 0x00,
            0x15, 0xAD,
        ];
        assert_eq!(digest(b"abc"), expected);
    }

    #[test]
    fn verification_covers_only_the_declared_length() {
        // Given
        let image: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = digest(&image[..130_000]);

        // Then
        assert!(verify(&image, 130_000, &expected));
        assert!(!verify(&image, 130_001, &expected));
        assert!(!verify(&image, 300_000, &expected));
    }

    #[test]
    fn any_flipped_byte_fails_verification() {
        let mut image = vec![0x5Au8; kb!(64) + 17];
        let expected = digest(&image);
        for position in [0, kb!(64) - 1, kb!(64), kb!(64) + 16] {
            image[position] ^= 0x01;
            assert!(!verify(&image, image.len(), &expected));
            image[position] ^= 0x01;
        }
        assert!(verify(&image, image.len(), &expected));
    }
}
