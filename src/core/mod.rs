pub mod cancel;
pub mod cluster;
pub mod duplicate;
pub mod exif;
pub mod fingerprint;
pub mod model;
pub mod perceptual;
pub mod tie_break;

pub use cancel::CancellationToken;
pub use duplicate::{DedupError, GroupingEngine};
pub use fingerprint::ContentFingerprinter;
pub use perceptual::PerceptualService;
