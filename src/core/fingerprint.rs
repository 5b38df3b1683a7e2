use image::{imageops::FilterType, DynamicImage, ImageFormat};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::core::exif::ExifService;
use crate::core::model::{ContentHash, ContentKind, DeclaredFormat, Dimensions, Fingerprint};
use crate::core::perceptual::{PerceptualHash, PerceptualService};

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("Content exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Text is not valid UTF-8")]
    InvalidText,

    #[error("Text is empty")]
    EmptyText,
}

/// Derived content handed to the embedding provider. Raw file bytes are never
/// kept; images are reduced to a normalized thumbnail, text to a prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbedContent {
    Text(String),
    /// PNG-encoded square thumbnail.
    Image(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct FingerprintOutput {
    pub fingerprint: Fingerprint,
    pub payload: Option<EmbedContent>,
}

/// Computes content hashes, perceptual hashes, and embedding payloads from a
/// byte stream.
pub struct ContentFingerprinter {
    chunk_size: usize,
    max_text_chars: usize,
    max_image_bytes: usize,
    max_document_bytes: usize,
    max_pdf_pages: usize,
    embed_image_size: u32,
    perceptual: PerceptualService,
    exif: ExifService,
}

/// How much of the stream is kept after hashing.
enum Retention {
    /// Keep everything up to `limit`; past it the buffer is dropped.
    Whole { limit: usize },
    Prefix { limit: usize },
    Nothing,
}

impl ContentFingerprinter {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            chunk_size: config.read_chunk_size.max(1),
            max_text_chars: config.max_text_chars,
            max_image_bytes: config.max_image_bytes,
            max_document_bytes: config.max_document_bytes,
            max_pdf_pages: config.max_pdf_pages,
            embed_image_size: config.embed_image_size.max(1),
            perceptual: PerceptualService::new(),
            exif: ExifService::new(),
        }
    }

    fn retention(&self, declared: DeclaredFormat) -> Retention {
        match declared {
            DeclaredFormat::Image => Retention::Whole {
                limit: self.max_image_bytes,
            },
            DeclaredFormat::Pdf => Retention::Whole {
                limit: self.max_document_bytes,
            },
            DeclaredFormat::Text => Retention::Prefix {
                limit: self.max_text_chars.saturating_mul(4),
            },
            DeclaredFormat::Other => Retention::Nothing,
        }
    }

    /// Consume `reader` once. The SHA-256 digest is streamed in bounded
    /// chunks. Images and PDFs are buffered up to their byte bounds for
    /// decoding; text keeps only the prefix needed for embedding.
    pub fn fingerprint<R: Read>(
        &self,
        mut reader: R,
        declared: DeclaredFormat,
    ) -> Result<FingerprintOutput, FingerprintError> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; self.chunk_size];
        let retention = self.retention(declared);
        let mut retained: Vec<u8> = Vec::new();
        let mut overflowed: Option<usize> = None;

        loop {
            let bytes_read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            let chunk = &buffer[..bytes_read];
            hasher.update(chunk);

            match retention {
                Retention::Whole { .. } if overflowed.is_some() => {}
                Retention::Whole { limit } => {
                    if retained.len() + chunk.len() > limit {
                        overflowed = Some(limit);
                        retained = Vec::new();
                    } else {
                        retained.extend_from_slice(chunk);
                    }
                }
                Retention::Prefix { limit } if retained.len() < limit => {
                    let room = limit - retained.len();
                    retained.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                _ => {}
            }
        }

        let content_hash = ContentHash(format!("{:x}", hasher.finalize()));

        if let Some(limit) = overflowed {
            log::warn!(
                "Skipping content analysis for {}: {}",
                content_hash.short(),
                FingerprintError::TooLarge { limit }
            );
            return Ok(Self::other(content_hash));
        }

        let output = match declared {
            DeclaredFormat::Image => match self.analyze_image(&retained) {
                Ok((dimensions, perceptual_hash, thumbnail)) => FingerprintOutput {
                    fingerprint: Fingerprint {
                        content_hash,
                        perceptual_hash: Some(perceptual_hash),
                        content_kind: ContentKind::Image,
                        dimensions: Some(dimensions),
                    },
                    payload: Some(EmbedContent::Image(thumbnail)),
                },
                Err(e) => {
                    log::warn!("Image decode failed for {}: {}", content_hash.short(), e);
                    Self::other(content_hash)
                }
            },
            DeclaredFormat::Pdf => match self.extract_pdf_text(&retained) {
                Ok(text) => Self::text(content_hash, text),
                Err(e) => {
                    log::warn!("PDF text extraction failed for {}: {}", content_hash.short(), e);
                    Self::other(content_hash)
                }
            },
            DeclaredFormat::Text => match self.extract_text(&retained) {
                Ok(text) => Self::text(content_hash, text),
                Err(e) => {
                    log::debug!("Treating {} as opaque content: {}", content_hash.short(), e);
                    Self::other(content_hash)
                }
            },
            DeclaredFormat::Other => Self::other(content_hash),
        };

        Ok(output)
    }

    fn text(content_hash: ContentHash, text: String) -> FingerprintOutput {
        FingerprintOutput {
            fingerprint: Fingerprint {
                content_hash,
                perceptual_hash: None,
                content_kind: ContentKind::Text,
                dimensions: None,
            },
            payload: Some(EmbedContent::Text(text)),
        }
    }

    fn other(content_hash: ContentHash) -> FingerprintOutput {
        FingerprintOutput {
            fingerprint: Fingerprint {
                content_hash,
                perceptual_hash: None,
                content_kind: ContentKind::Other,
                dimensions: None,
            },
            payload: None,
        }
    }

    fn analyze_image(
        &self,
        bytes: &[u8],
    ) -> Result<(Dimensions, PerceptualHash, Vec<u8>), FingerprintError> {
        let decoded = image::load_from_memory(bytes)?;
        let image = self.exif.normalize(decoded, self.exif.orientation(bytes));
        let dimensions = Dimensions {
            width: image.width(),
            height: image.height(),
        };
        let perceptual_hash = self.perceptual.compute(&image);
        let thumbnail = self.thumbnail(&image)?;
        Ok((dimensions, perceptual_hash, thumbnail))
    }

    fn thumbnail(&self, image: &DynamicImage) -> Result<Vec<u8>, FingerprintError> {
        let size = self.embed_image_size;
        let rgb = image.resize_exact(size, size, FilterType::Triangle).into_rgb8();
        let mut encoded = Vec::new();
        DynamicImage::ImageRgb8(rgb).write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)?;
        Ok(encoded)
    }

    fn extract_text(&self, bytes: &[u8]) -> Result<String, FingerprintError> {
        let valid = match std::str::from_utf8(bytes) {
            Ok(s) => s,
            // A multi-byte character cut off by the prefix limit is fine.
            Err(e) if e.error_len().is_none() => {
                std::str::from_utf8(&bytes[..e.valid_up_to()]).map_err(|_| FingerprintError::InvalidText)?
            }
            Err(_) => return Err(FingerprintError::InvalidText),
        };

        self.bounded_text(valid)
    }

    /// Text of the first `max_pdf_pages` pages.
    fn extract_pdf_text(&self, bytes: &[u8]) -> Result<String, FingerprintError> {
        let document = lopdf::Document::load_mem(bytes)?;
        let pages: Vec<u32> = document
            .get_pages()
            .keys()
            .copied()
            .take(self.max_pdf_pages)
            .collect();
        let text = document.extract_text(&pages)?;
        self.bounded_text(&text)
    }

    fn bounded_text(&self, raw: &str) -> Result<String, FingerprintError> {
        let text: String = raw.trim().chars().take(self.max_text_chars).collect();
        if text.is_empty() {
            return Err(FingerprintError::EmptyText);
        }
        Ok(text)
    }
}

impl Default for ContentFingerprinter {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}
