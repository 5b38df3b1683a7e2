//! Content deduplication and similarity grouping.
//!
//! Files are matched in three tiers: exact SHA-256 content hash, perceptual
//! hash for images, and embedding similarity through an external gateway and
//! a vector index. Matches are grouped by single linkage and one file per
//! group is kept.

pub mod config;
pub mod core;
pub mod services;

pub use config::{ConfigError, DedupOptions, EngineConfig};
pub use core::model::{
    ContentHash, ContentKind, DeclaredFormat, DedupReport, DedupStats, Dimensions, DuplicateEntry,
    DuplicateGroup, EmbeddingKind, FileDescriptor, FileSummary, MatchReason, UngroupedFile,
    UngroupedReason,
};
pub use core::{CancellationToken, DedupError, GroupingEngine};
