//! Image ingestion: data-URI / base64 decoding and validation.
//!
//! Clients send photos as `data:image/jpeg;base64,...` strings or as bare
//! base64. The payload is size-checked before and after decoding, its format
//! is sniffed from the bytes, and the result is converted to 8-bit RGB.

use base64::Engine;
use image::{ImageFormat, ImageReader, RgbImage};
use std::io::Cursor;
use thiserror::Error;

/// Formats accepted from clients.
const ACCEPTED_FORMATS: [ImageFormat; 4] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Bmp,
];

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("image data is empty")]
    Empty,
    #[error("malformed data URI: {0}")]
    InvalidDataUri(String),
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("unrecognized image format")]
    UnknownFormat,
    #[error("unsupported image format: {0:?}")]
    UnsupportedFormat(ImageFormat),
    #[error("image dimensions {width}x{height} outside 1..={max}")]
    BadDimensions { width: u32, height: u32, max: u32 },
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Bounds applied while decoding a client image.
#[derive(Debug, Clone, Copy)]
pub struct IngestLimits {
    /// Maximum decoded byte length of the encoded image file.
    pub max_bytes: usize,
    /// Maximum width and height in pixels.
    pub max_dimension: u32,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            max_dimension: 4096,
        }
    }
}

impl IngestLimits {
    /// Largest base64 text that can still decode to `max_bytes`.
    pub fn max_encoded_len(&self) -> usize {
        self.max_bytes.div_ceil(3) * 4
    }
}

/// A decoded client image.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub rgb: RgbImage,
    pub format: ImageFormat,
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }
}

/// Split off a `data:` header, returning the base64 payload.
///
/// Bare base64 passes through unchanged.
fn strip_data_uri(input: &str) -> Result<&str, IngestError> {
    let Some(rest) = input.strip_prefix("data:") else {
        return Ok(input);
    };

    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| IngestError::InvalidDataUri("missing ',' separator".into()))?;

    let mut parts = header.split(';');
    let mime = parts.next().unwrap_or_default().trim();
    if mime.is_empty() {
        return Err(IngestError::InvalidDataUri("missing MIME type".into()));
    }
    if !mime.to_ascii_lowercase().starts_with("image/") {
        return Err(IngestError::InvalidDataUri(format!("not an image type: {mime}")));
    }
    if !parts.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err(IngestError::InvalidDataUri("payload is not base64".into()));
    }

    Ok(payload)
}

/// Decode base64 text into raw bytes, ignoring embedded ASCII whitespace.
fn decode_base64(payload: &str, limits: &IngestLimits) -> Result<Vec<u8>, IngestError> {
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(IngestError::Empty);
    }
    if compact.len() > limits.max_encoded_len() {
        return Err(IngestError::TooLarge {
            size: compact.len() / 4 * 3,
            max: limits.max_bytes,
        });
    }

    let bytes = base64::engine::general_purpose::STANDARD.decode(compact.as_bytes())?;
    if bytes.len() > limits.max_bytes {
        return Err(IngestError::TooLarge {
            size: bytes.len(),
            max: limits.max_bytes,
        });
    }
    Ok(bytes)
}

/// Decode image file bytes into RGB, enforcing format and dimension limits.
pub fn decode_bytes(bytes: &[u8], limits: &IngestLimits) -> Result<DecodedImage, IngestError> {
    if bytes.is_empty() {
        return Err(IngestError::Empty);
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| IngestError::Decode(image::ImageError::IoError(e)))?;
    let format = reader.format().ok_or(IngestError::UnknownFormat)?;
    if !ACCEPTED_FORMATS.contains(&format) {
        return Err(IngestError::UnsupportedFormat(format));
    }

    let (width, height) = reader.into_dimensions()?;
    if width == 0 || height == 0 || width > limits.max_dimension || height > limits.max_dimension {
        return Err(IngestError::BadDimensions {
            width,
            height,
            max: limits.max_dimension,
        });
    }

    let image = image::load_from_memory_with_format(bytes, format)?;
    let rgb = image.to_rgb8();

    tracing::debug!(?format, width, height, bytes = bytes.len(), "decoded image");

    Ok(DecodedImage { rgb, format })
}

/// Decode a client-supplied image string (data URI or bare base64).
pub fn decode_image(input: &str, limits: &IngestLimits) -> Result<DecodedImage, IngestError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(IngestError::Empty);
    }

    let payload = strip_data_uri(input)?;
    let bytes = decode_base64(payload, limits)?;
    decode_bytes(&bytes, limits)
}
