use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read};
use std::time::Duration;
use uuid::Uuid;

use crate::core::perceptual::PerceptualHash;

/// Opaque id scoping one `deduplicate` run inside the similarity index.
pub type SessionId = Uuid;

/// Lowercase hex SHA-256 digest of a file's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(16) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
    Other,
}

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "tsv", "json", "xml", "yaml", "yml", "toml", "html", "htm",
    "log", "rst", "ini",
];

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp",
];

/// The on-disk format a caller declared, which decides how the content is
/// read. PDFs are read as documents and end up as text content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclaredFormat {
    Text,
    Pdf,
    Image,
    Other,
}

impl DeclaredFormat {
    /// Classify a file from its declared MIME type, falling back to the
    /// extension of `name` when the MIME type carries no information.
    pub fn from_declared(mime: &str, name: &str) -> Self {
        let mime = mime.trim().to_ascii_lowercase();
        let essence = mime.split(';').next().unwrap_or_default().trim();

        if essence.is_empty() || essence == "application/octet-stream" {
            return Self::from_extension(name);
        }
        if essence.starts_with("image/") {
            return DeclaredFormat::Image;
        }
        if essence.starts_with("text/") {
            return DeclaredFormat::Text;
        }
        match essence {
            "application/pdf" | "application/x-pdf" => DeclaredFormat::Pdf,
            "application/json"
            | "application/xml"
            | "application/javascript"
            | "application/x-yaml"
            | "application/yaml"
            | "application/x-ndjson" => DeclaredFormat::Text,
            _ => DeclaredFormat::Other,
        }
    }

    fn from_extension(name: &str) -> Self {
        let Some((_, ext)) = name.rsplit_once('.') else {
            return DeclaredFormat::Other;
        };
        let ext = ext.to_ascii_lowercase();
        if ext == "pdf" {
            DeclaredFormat::Pdf
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            DeclaredFormat::Image
        } else if TEXT_EXTENSIONS.contains(&ext.as_str()) {
            DeclaredFormat::Text
        } else {
            DeclaredFormat::Other
        }
    }

    pub fn content_kind(self) -> ContentKind {
        match self {
            DeclaredFormat::Text | DeclaredFormat::Pdf => ContentKind::Text,
            DeclaredFormat::Image => ContentKind::Image,
            DeclaredFormat::Other => ContentKind::Other,
        }
    }
}

impl ContentKind {
    pub fn from_declared(mime: &str, name: &str) -> Self {
        DeclaredFormat::from_declared(mime, name).content_kind()
    }

    pub fn embedding_kind(self) -> Option<EmbeddingKind> {
        match self {
            ContentKind::Text => Some(EmbeddingKind::Text),
            ContentKind::Image => Some(EmbeddingKind::Image),
            ContentKind::Other => None,
        }
    }
}

/// Kinds the embedding provider understands. Vectors of different kinds have
/// different dimensionality and are never compared with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingKind {
    Text,
    Image,
}

impl EmbeddingKind {
    pub const ALL: [EmbeddingKind; 2] = [EmbeddingKind::Text, EmbeddingKind::Image];

    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingKind::Text => "text",
            EmbeddingKind::Image => "image",
        }
    }
}

impl fmt::Display for EmbeddingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// One input file. The content handle is read exactly once by the engine.
pub struct FileDescriptor {
    pub id: String,
    pub name: String,
    pub declared_mime_type: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub dimensions: Option<Dimensions>,
    content: Option<Box<dyn Read + Send>>,
}

impl FileDescriptor {
    /// A descriptor without content. Attach a handle with `with_content` or
    /// `with_bytes`; a descriptor submitted without one is rejected.
    pub fn new(id: impl Into<String>, name: impl Into<String>, mime: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            declared_mime_type: mime.into(),
            size_bytes: 0,
            modified_at: None,
            dimensions: None,
            content: None,
        }
    }

    pub fn with_content<R: Read + Send + 'static>(mut self, reader: R, size_bytes: u64) -> Self {
        self.content = Some(Box::new(reader));
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_bytes(self, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let size = bytes.len() as u64;
        self.with_content(Cursor::new(bytes), size)
    }

    pub fn with_modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Some(Dimensions { width, height });
        self
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    pub(crate) fn take_content(&mut self) -> Option<Box<dyn Read + Send>> {
        self.content.take()
    }

    pub fn declared_kind(&self) -> ContentKind {
        self.declared_format().content_kind()
    }

    pub fn declared_format(&self) -> DeclaredFormat {
        DeclaredFormat::from_declared(&self.declared_mime_type, &self.name)
    }

    pub fn summary(&self) -> FileSummary {
        FileSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            mime_type: self.declared_mime_type.clone(),
            size_bytes: self.size_bytes,
            modified_at: self.modified_at,
            dimensions: self.dimensions,
        }
    }
}

impl fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("declared_mime_type", &self.declared_mime_type)
            .field("size_bytes", &self.size_bytes)
            .field("modified_at", &self.modified_at)
            .field("has_content", &self.content.is_some())
            .finish()
    }
}

/// The metadata of a file as it appears in results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSummary {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub dimensions: Option<Dimensions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub content_hash: ContentHash,
    pub perceptual_hash: Option<PerceptualHash>,
    pub content_kind: ContentKind,
    pub dimensions: Option<Dimensions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub file_id: String,
    pub kind: EmbeddingKind,
    pub vector: Vec<f32>,
    pub source_hash: ContentHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchReason {
    ExactHash,
    NearDuplicateImage,
    NearDuplicateText,
}

impl MatchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchReason::ExactHash => "exact-hash",
            MatchReason::NearDuplicateImage => "near-duplicate-image",
            MatchReason::NearDuplicateText => "near-duplicate-text",
        }
    }
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateEntry {
    pub file: FileSummary,
    pub similarity_score: f64,
    pub reason: MatchReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub group_id: Uuid,
    pub kept_file: FileSummary,
    pub duplicates: Vec<DuplicateEntry>,
    pub total_size_reclaimed: u64,
}

impl DuplicateGroup {
    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.kept_file.id.as_str())
            .chain(self.duplicates.iter().map(|d| d.file.id.as_str()))
    }

    /// Kept file plus duplicates.
    pub fn member_count(&self) -> usize {
        self.duplicates.len() + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UngroupedReason {
    InvalidInput,
    EmbeddingUnavailable,
    IndexUnavailable,
}

impl fmt::Display for UngroupedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UngroupedReason::InvalidInput => "invalid input",
            UngroupedReason::EmbeddingUnavailable => "embedding unavailable",
            UngroupedReason::IndexUnavailable => "similarity index unavailable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UngroupedFile {
    pub file_id: String,
    /// Position of the descriptor in the submitted batch. Tells apart
    /// entries for a repeated id.
    pub input_index: usize,
    pub reason_unavailable: UngroupedReason,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupStats {
    pub files_total: usize,
    pub exact_groups: usize,
    pub near_duplicate_groups: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub gateway_calls: usize,
    pub bytes_reclaimable: u64,
    pub fingerprint_duration: Duration,
    pub embedding_duration: Duration,
    pub similarity_duration: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupReport {
    pub session_id: SessionId,
    pub groups: Vec<DuplicateGroup>,
    pub ungrouped: Vec<UngroupedFile>,
    /// Files that were fingerprinted and compared but matched nothing.
    pub unique: Vec<String>,
    pub stats: DedupStats,
}

impl DedupReport {
    pub fn group_containing(&self, file_id: &str) -> Option<&DuplicateGroup> {
        self.groups
            .iter()
            .find(|g| g.member_ids().any(|id| id == file_id))
    }

    /// Why `file_id` ended up ungrouped. Returns `None` when a descriptor
    /// with that id was admitted and placed in a group or in `unique`, even
    /// if a later duplicate of the id was rejected. Otherwise the entry with
    /// the lowest batch position wins; `ungrouped_at` looks up a specific one.
    pub fn ungrouped_reason(&self, file_id: &str) -> Option<UngroupedReason> {
        let placed = self.group_containing(file_id).is_some()
            || self.unique.iter().any(|id| id == file_id);
        if placed {
            return None;
        }
        self.ungrouped
            .iter()
            .find(|u| u.file_id == file_id)
            .map(|u| u.reason_unavailable)
    }

    pub fn ungrouped_at(&self, input_index: usize) -> Option<&UngroupedFile> {
        self.ungrouped.iter().find(|u| u.input_index == input_index)
    }
}
