use image::DynamicImage;
use image_hasher::{HashAlg, Hasher, HasherConfig};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bits in a perceptual hash (8x8 mean hash).
pub const PERCEPTUAL_HASH_BITS: u32 = 64;

/// 64-bit mean hash, compared by Hamming distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    pub fn distance(&self, other: &PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// `1 - distance / 64`
    pub fn similarity(&self, other: &PerceptualHash) -> f64 {
        1.0 - self.distance(other) as f64 / PERCEPTUAL_HASH_BITS as f64
    }

    /// Whether two hashes are close enough to be near-duplicate candidates.
    pub fn is_candidate(&self, other: &PerceptualHash, max_distance: u32) -> bool {
        self.distance(other) <= max_distance
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

pub struct PerceptualService {
    hasher: Hasher,
}

impl PerceptualService {
    pub fn new() -> Self {
        let hasher = HasherConfig::new()
            .hash_alg(HashAlg::Mean)
            .hash_size(8, 8)
            .to_hasher();
        Self { hasher }
    }

    pub fn compute(&self, image: &DynamicImage) -> PerceptualHash {
        let hash = self.hasher.hash_image(image);
        let bits = hash
            .as_bytes()
            .iter()
            .take(8)
            .fold(0u64, |acc, byte| (acc << 8) | *byte as u64);
        PerceptualHash(bits)
    }
}

impl Default for PerceptualService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn gradient(width: u32, height: u32, offset: u8) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            let v = ((x * 255 / width.max(1)) as u8).saturating_add(offset);
            let w = (y * 255 / height.max(1)) as u8;
            Rgb([v, w, v / 2])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_distance_and_similarity() {
        let a = PerceptualHash(0);
        let b = PerceptualHash(0b111);
        assert_eq!(a.distance(&b), 3);
        assert!((a.similarity(&b) - (1.0 - 3.0 / 64.0)).abs() < 1e-12);
        assert_eq!(a.similarity(&a), 1.0);
        assert_eq!(PerceptualHash(0).distance(&PerceptualHash(u64::MAX)), 64);
    }

    #[test]
    fn test_hex_format() {
        assert_eq!(PerceptualHash(0xff).to_hex(), "00000000000000ff");
    }

    #[test]
    fn test_resized_image_is_candidate() {
        let service = PerceptualService::new();
        let large = gradient(256, 256, 0);
        let small = large.resize_exact(128, 128, image::imageops::FilterType::Triangle);

        let h1 = service.compute(&large);
        let h2 = service.compute(&small);
        assert!(h1.is_candidate(&h2, 10));
    }

    #[test]
    fn test_inverted_image_is_not_candidate() {
        let service = PerceptualService::new();
        let original = gradient(128, 128, 0);
        let mut inverted = original.clone();
        inverted.invert();

        let h1 = service.compute(&original);
        let h2 = service.compute(&inverted);
        assert!(!h1.is_candidate(&h2, 10));
    }

    #[test]
    fn test_candidate_threshold_is_inclusive() {
        let base = PerceptualHash(0);
        let ten_bits = PerceptualHash((1 << 10) - 1);
        let eleven_bits = PerceptualHash((1 << 11) - 1);

        assert!(base.is_candidate(&ten_bits, 10));
        assert!(!base.is_candidate(&eleven_bits, 10));
    }
}
