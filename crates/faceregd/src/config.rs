use facereg_core::{IngestLimits, MatchMetric};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::store::DuplicatePolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Daemon configuration.
///
/// Layered: built-in defaults, then the TOML file named by `FACEREG_CONFIG`
/// (if set), then `FACEREG_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket address the HTTP server binds to (default: 0.0.0.0:5001).
    pub bind_addr: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Distance metric used for matching.
    pub match_metric: MatchMetric,
    /// Acceptance threshold for `match_metric`.
    pub match_threshold: f32,
    /// What registering an already-known name does.
    pub duplicate_names: DuplicatePolicy,
    /// Number of engine worker threads, each with its own model sessions.
    pub workers: usize,
    /// Upper bound on faces analysed per image.
    pub max_faces: usize,
    /// Timeout for decoding a client image.
    pub decode_timeout: Duration,
    /// Timeout for detection + embedding of one image.
    pub detect_timeout: Duration,
    /// Maximum size of a decoded image file in bytes.
    pub max_image_bytes: usize,
    /// Maximum image width/height in pixels.
    pub max_image_dimension: u32,
}

/// Optional overrides read from the TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind_addr: Option<String>,
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    match_metric: Option<MatchMetric>,
    match_threshold: Option<f32>,
    duplicate_names: Option<DuplicatePolicy>,
    workers: Option<usize>,
    max_faces: Option<usize>,
    decode_timeout_ms: Option<u64>,
    detect_timeout_ms: Option<u64>,
    max_image_bytes: Option<usize>,
    max_image_dimension: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = facereg_core::default_data_dir();
        Self {
            bind_addr: "0.0.0.0:5001".to_string(),
            model_dir: facereg_core::default_model_dir(),
            db_path: data_dir.join("faces.db"),
            match_metric: MatchMetric::Cosine,
            match_threshold: MatchMetric::Cosine.default_threshold(),
            duplicate_names: DuplicatePolicy::Reject,
            workers: 2,
            max_faces: 20,
            decode_timeout: Duration::from_millis(2000),
            detect_timeout: Duration::from_millis(5000),
            max_image_bytes: IngestLimits::default().max_bytes,
            max_image_dimension: IngestLimits::default().max_dimension,
        }
    }
}

impl Config {
    /// Load configuration from defaults, `FACEREG_CONFIG` and `FACEREG_*`
    /// environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("FACEREG_CONFIG") {
            config.apply_file(&FileConfig::read(Path::new(&path))?);
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: &FileConfig) {
        if let Some(v) = &file.bind_addr {
            self.bind_addr = v.clone();
        }
        if let Some(v) = &file.model_dir {
            self.model_dir = v.clone();
        }
        if let Some(v) = &file.db_path {
            self.db_path = v.clone();
        }
        if let Some(metric) = file.match_metric {
            self.set_metric(metric);
        }
        if let Some(v) = file.match_threshold {
            self.match_threshold = v;
        }
        if let Some(v) = file.duplicate_names {
            self.duplicate_names = v;
        }
        if let Some(v) = file.workers {
            self.workers = v;
        }
        if let Some(v) = file.max_faces {
            self.max_faces = v;
        }
        if let Some(v) = file.decode_timeout_ms {
            self.decode_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.detect_timeout_ms {
            self.detect_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.max_image_bytes {
            self.max_image_bytes = v;
        }
        if let Some(v) = file.max_image_dimension {
            self.max_image_dimension = v;
        }
    }

    /// Apply `FACEREG_*` overrides. `lookup` abstracts the environment so the
    /// layering can be tested without touching process state.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("FACEREG_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("FACEREG_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEREG_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(metric) = parse_env(&lookup, "FACEREG_MATCH_METRIC")? {
            self.set_metric(metric);
        }
        if let Some(v) = parse_env(&lookup, "FACEREG_MATCH_THRESHOLD")? {
            self.match_threshold = v;
        }
        if let Some(v) = parse_env(&lookup, "FACEREG_DUPLICATE_NAMES")? {
            self.duplicate_names = v;
        }
        if let Some(v) = parse_env(&lookup, "FACEREG_WORKERS")? {
            self.workers = v;
        }
        if let Some(v) = parse_env(&lookup, "FACEREG_MAX_FACES")? {
            self.max_faces = v;
        }
        if let Some(v) = parse_env(&lookup, "FACEREG_DECODE_TIMEOUT_MS")? {
            self.decode_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_env(&lookup, "FACEREG_DETECT_TIMEOUT_MS")? {
            self.detect_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_env(&lookup, "FACEREG_MAX_IMAGE_BYTES")? {
            self.max_image_bytes = v;
        }
        if let Some(v) = parse_env(&lookup, "FACEREG_MAX_IMAGE_DIMENSION")? {
            self.max_image_dimension = v;
        }
        Ok(())
    }

    /// Switching metric also switches to that metric's default threshold;
    /// an explicit threshold applied afterwards wins.
    fn set_metric(&mut self, metric: MatchMetric) {
        if metric != self.match_metric {
            self.match_metric = metric;
            self.match_threshold = metric.default_threshold();
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "workers",
                value: "0".into(),
            });
        }
        if self.max_faces == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_faces",
                value: "0".into(),
            });
        }
        if !self.match_threshold.is_finite() {
            return Err(ConfigError::InvalidValue {
                key: "match_threshold",
                value: self.match_threshold.to_string(),
            });
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(facereg_core::SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(facereg_core::ARCFACE_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    pub fn ingest_limits(&self) -> IngestLimits {
        IngestLimits {
            max_bytes: self.max_image_bytes,
            max_dimension: self.max_image_dimension,
        }
    }

    /// HTTP body limit: base64 text of the largest image plus JSON slack.
    pub fn max_body_bytes(&self) -> usize {
        self.ingest_limits().max_encoded_len() + 64 * 1024
    }
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn parse_env<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}
