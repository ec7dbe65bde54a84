//! facereg-core: Face detection, recognition and matching engine.
//!
//! Decodes client photos, finds faces with SCRFD, embeds them with ArcFace
//! (both via ONNX Runtime on the CPU) and matches embeddings against a
//! gallery of named persons.

pub mod alignment;
pub mod detector;
pub mod ingest;
pub mod matcher;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use detector::{Detector, DetectorError, FaceDetector};
pub use ingest::{decode_image, DecodedImage, IngestError, IngestLimits};
pub use matcher::{CosineMatcher, EuclideanMatcher, MatchMetric, Matcher};
pub use recognizer::{Embedder, FaceRecognizer, RecognizerError};
pub use types::{BoundingBox, DetectedFace, Embedding, MatchResult, Person, RecognitionResult};

/// File name of the SCRFD detection model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default model directory: `$XDG_DATA_HOME/facereg/models`, falling back to
/// `~/.local/share/facereg/models`.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

/// Per-user data directory shared by the daemon and the CLI.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facereg")
}
