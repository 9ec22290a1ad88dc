// ESP application image layout helpers
//
// Offsets follow esp_image_header_t / esp_app_desc_t:
//   0   header (24 bytes)   magic 0xE9, segment count, ..., hash_appended @23
//   24  first segment header (8 bytes)
//   32  esp_app_desc_t      magic 0xABCD5432, version @+16, project @+48
//   end SHA-256 over everything before it when hash_appended == 1

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const IMAGE_MAGIC: u8 = 0xE9;
pub const IMAGE_HEADER_LEN: usize = 24;
pub const SEGMENT_HEADER_LEN: usize = 8;
pub const APP_DESC_OFFSET: usize = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN;
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;
pub const APP_DESC_LEN: usize = 256;
pub const DIGEST_LEN: usize = 32;
pub const MAX_SEGMENTS: u8 = 16;

const HASH_APPENDED_OFFSET: usize = 23;
const VERSION_OFFSET: usize = 16;
const PROJECT_OFFSET: usize = 48;
const NAME_LEN: usize = 32;

/// Smallest image [`synthesize`] can produce
pub const MIN_SYNTH_LEN: usize = APP_DESC_OFFSET + APP_DESC_LEN + DIGEST_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("image too short ({0} bytes)")]
    TooShort(usize),
    #[error("bad image magic 0x{0:02x}")]
    BadMagic(u8),
    #[error("invalid segment count {0}")]
    BadSegmentCount(u8),
    #[error("appended SHA-256 does not match image contents")]
    DigestMismatch,
}

/// Structural check of a complete image
pub fn validate(image: &[u8]) -> Result<(), ImageError> {
    if image.len() < IMAGE_HEADER_LEN {
        return Err(ImageError::TooShort(image.len()));
    }
    if image[0] != IMAGE_MAGIC {
        return Err(ImageError::BadMagic(image[0]));
    }
    let segments = image[1];
    if segments == 0 || segments > MAX_SEGMENTS {
        return Err(ImageError::BadSegmentCount(segments));
    }
    if image[HASH_APPENDED_OFFSET] == 1 {
        if image.len() < IMAGE_HEADER_LEN + DIGEST_LEN {
            return Err(ImageError::TooShort(image.len()));
        }
        let (body, digest) = image.split_at(image.len() - DIGEST_LEN);
        if Sha256::digest(body).as_slice() != digest {
            return Err(ImageError::DigestMismatch);
        }
    }
    Ok(())
}

/// Identity fields from the image's application descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    pub version: heapless::String<NAME_LEN>,
    pub project: heapless::String<NAME_LEN>,
}

impl AppDescriptor {
    /// Parse from the first bytes of an image. `None` if they are too short
    /// or carry no descriptor.
    pub fn parse(head: &[u8]) -> Option<Self> {
        if head.len() < APP_DESC_OFFSET + PROJECT_OFFSET + NAME_LEN || head[0] != IMAGE_MAGIC {
            return None;
        }
        let desc = &head[APP_DESC_OFFSET..];
        let magic = u32::from_le_bytes([desc[0], desc[1], desc[2], desc[3]]);
        if magic != APP_DESC_MAGIC {
            return None;
        }
        Some(Self {
            version: c_field(&desc[VERSION_OFFSET..VERSION_OFFSET + NAME_LEN]),
            project: c_field(&desc[PROJECT_OFFSET..PROJECT_OFFSET + NAME_LEN]),
        })
    }
}

// NUL-terminated, fixed-width C string field
fn c_field(raw: &[u8]) -> heapless::String<NAME_LEN> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let mut out = heapless::String::new();
    for ch in String::from_utf8_lossy(&raw[..end]).chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// Build a structurally valid image of exactly `total_len` bytes with an
/// appended digest. Lengths below [`MIN_SYNTH_LEN`] are rounded up.
pub fn synthesize(version: &str, project: &str, total_len: usize) -> Vec<u8> {
    let total_len = total_len.max(MIN_SYNTH_LEN);
    let mut image = vec![0u8; total_len - DIGEST_LEN];

    image[0] = IMAGE_MAGIC;
    image[1] = 1;
    image[2] = 0x02; // DIO
    image[4..8].copy_from_slice(&0x4037_5a00u32.to_le_bytes());
    image[HASH_APPENDED_OFFSET] = 1;

    let segment_len = (total_len - APP_DESC_OFFSET - DIGEST_LEN) as u32;
    image[IMAGE_HEADER_LEN..IMAGE_HEADER_LEN + 4].copy_from_slice(&0x3c00_0020u32.to_le_bytes());
    image[IMAGE_HEADER_LEN + 4..APP_DESC_OFFSET].copy_from_slice(&segment_len.to_le_bytes());

    let desc = APP_DESC_OFFSET;
    image[desc..desc + 4].copy_from_slice(&APP_DESC_MAGIC.to_le_bytes());
    write_c_field(&mut image[desc + VERSION_OFFSET..desc + VERSION_OFFSET + NAME_LEN], version);
    write_c_field(&mut image[desc + PROJECT_OFFSET..desc + PROJECT_OFFSET + NAME_LEN], project);

    // Deterministic filler so corrupt-byte tests have something to flip
    let mut seed = 0x2545_f491u32;
    for byte in &mut image[desc + APP_DESC_LEN..] {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        *byte = seed as u8;
    }

    let digest = Sha256::digest(&image);
    image.extend_from_slice(&digest);
    image
}

fn write_c_field(dst: &mut [u8], value: &str) {
    let len = value.len().min(dst.len() - 1);
    dst[..len].copy_from_slice(&value.as_bytes()[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_image_validates_and_has_exact_length() {
        let image = synthesize("1.2.3", "sensor-node", 4096);
        assert_eq!(image.len(), 4096);
        assert_eq!(validate(&image), Ok(()));

        let desc = AppDescriptor::parse(&image[..512]).unwrap();
        assert_eq!(desc.version.as_str(), "1.2.3");
        assert_eq!(desc.project.as_str(), "sensor-node");
    }

    #[test]
    fn flipped_byte_breaks_the_digest() {
        let mut image = synthesize("1.0.0", "node", 2048);
        image[1000] ^= 0xff;
        assert_eq!(validate(&image), Err(ImageError::DigestMismatch));
    }

    #[test]
    fn header_checks() {
        assert_eq!(validate(&[IMAGE_MAGIC; 10]), Err(ImageError::TooShort(10)));
        let mut image = synthesize("1.0.0", "node", 1024);
        image[0] = 0x00;
        assert_eq!(validate(&image), Err(ImageError::BadMagic(0)));
        image[0] = IMAGE_MAGIC;
        image[1] = 0;
        assert_eq!(validate(&image), Err(ImageError::BadSegmentCount(0)));
    }

    #[test]
    fn descriptor_needs_enough_bytes_and_magic() {
        let image = synthesize("2.0.0", "node", 1024);
        assert!(AppDescriptor::parse(&image[..40]).is_none());
        let mut broken = image.clone();
        broken[APP_DESC_OFFSET] = 0;
        assert!(AppDescriptor::parse(&broken).is_none());
        assert!(AppDescriptor::parse(&[0u8; 512]).is_none());
    }

    #[test]
    fn tiny_requests_round_up() {
        assert_eq!(synthesize("1", "p", 10).len(), MIN_SYNTH_LEN);
    }
}
