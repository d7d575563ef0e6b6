//! Perceptual hashing for downloaded images.
//!
//! # Algorithm
//!
//! Uses the Blockhash algorithm which produces a consistent 64-bit hash.
//! The hash survives JPEG re-compression, resizing and minor cropping, so two
//! copies of the same picture served at different sizes land a few bits apart.
//!
//! # Usage
//!
//! ```no_run
//! use snapcrawl_core::hash::PerceptualHasher;
//!
//! let image = image::open("photo.jpg").unwrap();
//! let hash = PerceptualHasher::default().hash_image(&image);
//! let other = PerceptualHasher::default().hash_image(&image.thumbnail(256, 256));
//! let similar = hash.hamming_distance(other) <= 5;
//! ```

use std::fmt;
use std::str::FromStr;

use blockhash::{blockhash64, Blockhash64};
use image::DynamicImage;

use crate::error::{CrawlError, Result};

/// Hash width in bits.
pub const HASH_BITS: u32 = 64;

/// Fixed hash size in bytes.
pub const PERCEPTUAL_HASH_SIZE: usize = 8;

/// A 64-bit perceptual fingerprint. Immutable once computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PerceptualHash(u64);

impl PerceptualHash {
    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Number of differing bits between two hashes.
    pub fn hamming_distance(self, other: Self) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Check if two images are similar based on a Hamming distance threshold.
    pub fn is_similar(self, other: Self, threshold: u32) -> bool {
        self.hamming_distance(other) <= threshold
    }

    /// Get the hash as a 16-digit lowercase hexadecimal string.
    pub fn to_hex(self) -> String {
        hex::encode(self.0.to_be_bytes())
    }

    /// Parse a hash from its hexadecimal form.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes: [u8; PERCEPTUAL_HASH_SIZE] = hex::decode(hex_str)
            .map_err(|e| CrawlError::InvalidHash(format!("Invalid hex string: {e}")))?
            .try_into()
            .map_err(|v: Vec<u8>| {
                CrawlError::InvalidHash(format!(
                    "Expected {PERCEPTUAL_HASH_SIZE} bytes, got {}",
                    v.len()
                ))
            })?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PerceptualHash {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<u64> for PerceptualHash {
    fn from(bits: u64) -> Self {
        Self(bits)
    }
}

/// Computes perceptual hashes from decoded images.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerceptualHasher;

impl PerceptualHasher {
    /// Compute the perceptual hash of a decoded image.
    pub fn hash_image(&self, image: &DynamicImage) -> PerceptualHash {
        let hash: Blockhash64 = blockhash64(image);
        let bytes: [u8; PERCEPTUAL_HASH_SIZE] = hash.into();
        PerceptualHash(u64::from_be_bytes(bytes))
    }

    /// Decode raw bytes and hash them.
    pub fn hash_bytes(&self, image_data: &[u8]) -> Result<PerceptualHash> {
        let image = image::load_from_memory(image_data)
            .map_err(|e| CrawlError::Image(format!("Failed to decode image: {e}")))?;
        Ok(self.hash_image(&image))
    }

    /// Check if the provided bytes appear to be a supported image format.
    pub fn is_supported_format(data: &[u8]) -> bool {
        image::guess_format(data).is_ok()
    }
}
