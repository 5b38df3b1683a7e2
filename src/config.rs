use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::model::EmbeddingKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{field} must be within [0, 1], got {value}")]
    ThresholdOutOfRange { field: &'static str, value: f64 },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

/// Process-wide engine settings, fixed for the lifetime of a `GroupingEngine`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fingerprint_workers: usize,
    pub max_concurrent_embed_calls: usize,
    pub read_chunk_size: usize,
    /// Max Hamming distance (bits) for perceptual-hash candidates.
    pub perceptual_distance_threshold: u32,
    pub text_dimensions: usize,
    pub image_dimensions: usize,
    pub max_text_chars: usize,
    /// Images larger than this are hashed but not decoded.
    pub max_image_bytes: usize,
    /// PDFs larger than this are hashed but not parsed.
    pub max_document_bytes: usize,
    pub max_pdf_pages: usize,
    pub embed_image_size: u32,
    pub cache_capacity: Option<usize>,
    pub cache_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fingerprint_workers: num_cpus::get(),
            max_concurrent_embed_calls: 4,
            read_chunk_size: 8192,
            perceptual_distance_threshold: 10,
            text_dimensions: 384,
            image_dimensions: 512,
            max_text_chars: 8192,
            max_image_bytes: 10 * 1024 * 1024,
            max_document_bytes: 20 * 1024 * 1024,
            max_pdf_pages: 10,
            embed_image_size: 224,
            cache_capacity: None,
            cache_path: None,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("fingerprint_workers", self.fingerprint_workers),
            ("max_concurrent_embed_calls", self.max_concurrent_embed_calls),
            ("read_chunk_size", self.read_chunk_size),
            ("text_dimensions", self.text_dimensions),
            ("image_dimensions", self.image_dimensions),
            ("max_text_chars", self.max_text_chars),
            ("max_image_bytes", self.max_image_bytes),
            ("max_document_bytes", self.max_document_bytes),
            ("max_pdf_pages", self.max_pdf_pages),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.embed_image_size == 0 {
            return Err(ConfigError::Zero {
                field: "embed_image_size",
            });
        }
        Ok(())
    }

    pub fn dimensions_for(&self, kind: EmbeddingKind) -> usize {
        match kind {
            EmbeddingKind::Text => self.text_dimensions,
            EmbeddingKind::Image => self.image_dimensions,
        }
    }
}

/// Per-invocation options for `deduplicate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupOptions {
    pub image_threshold: f64,
    pub text_threshold: f64,
    pub max_embed_batch_size: usize,
    /// Deadline applied to every gateway batch call and index operation.
    pub deadline: Duration,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            image_threshold: 0.90,
            text_threshold: 0.85,
            max_embed_batch_size: 32,
            deadline: Duration::from_secs(30),
        }
    }
}

impl DedupOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("image_threshold", self.image_threshold),
            ("text_threshold", self.text_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange { field, value });
            }
        }
        if self.max_embed_batch_size == 0 {
            return Err(ConfigError::Zero {
                field: "max_embed_batch_size",
            });
        }
        if self.deadline.is_zero() {
            return Err(ConfigError::Zero { field: "deadline" });
        }
        Ok(())
    }

    pub fn threshold_for(&self, kind: EmbeddingKind) -> f64 {
        match kind {
            EmbeddingKind::Text => self.text_threshold,
            EmbeddingKind::Image => self.image_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_options() {
        let options = DedupOptions::default();
        assert_eq!(options.image_threshold, 0.90);
        assert_eq!(options.text_threshold, 0.85);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_threshold_out_of_range() {
        let options = DedupOptions {
            text_threshold: 1.5,
            ..DedupOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::ThresholdOutOfRange {
                field: "text_threshold",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let options = DedupOptions {
            max_embed_batch_size: 0,
            ..DedupOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_load_partial_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("engine.json");
        fs::write(&path, r#"{ "perceptual_distance_threshold": 6, "unknown": true }"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.perceptual_distance_threshold, 6);
        assert_eq!(config.text_dimensions, 384);
        assert_eq!(config.read_chunk_size, 8192);
    }

    #[test]
    fn test_load_rejects_zero_workers() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("engine.json");
        fs::write(&path, r#"{ "fingerprint_workers": 0 }"#).unwrap();

        assert!(matches!(
            EngineConfig::load(&path),
            Err(ConfigError::Zero { .. })
        ));
    }

    #[test]
    fn test_zero_text_chars_rejected() {
        let config = EngineConfig {
            max_text_chars: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "max_text_chars"
            })
        ));
    }

    #[test]
    fn test_zero_byte_bounds_rejected() {
        let config = EngineConfig {
            max_image_bytes: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "max_image_bytes"
            })
        ));
    }
}
