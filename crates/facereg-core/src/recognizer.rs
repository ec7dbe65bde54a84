//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from aligned RGB face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0 as in SCRFD
const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download from insightface and place in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a detected face into an identity embedding.
pub trait Embedder: Send {
    fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError>;
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Align `face` to the canonical crop. Requires SCRFD landmarks.
    fn aligned_crop(image: &RgbImage, face: &BoundingBox) -> Result<RgbImage, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        Ok(alignment::align_face(image, landmarks))
    }

    /// Convert a 112×112 RGB aligned crop into a NCHW float tensor.
    fn preprocess(aligned: &RgbImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in aligned.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

impl Embedder for FaceRecognizer {
    /// The face must carry landmarks (from SCRFD). It is aligned to the
    /// canonical 112×112 position before inference; the output is
    /// L2-normalized.
    fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let aligned = Self::aligned_crop(image, face)?;
        let input = Self::preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Ok(Embedding {
            values: raw_data.to_vec(),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        }
        .normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const SIZE: usize = ALIGNED_SIZE as usize;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([128, 128, 128]));
        let tensor = FaceRecognizer::preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, SIZE, SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let aligned = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([128, 0, 255]));
        let tensor = FaceRecognizer::preprocess(&aligned);
        let expect = |v: f32| (v - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 0, 5, 7]] - expect(128.0)).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 7]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 7]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_keeps_pixel_positions() {
        let mut aligned = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
        aligned.put_pixel(3, 90, Rgb([255, 255, 255]));
        let tensor = FaceRecognizer::preprocess(&aligned);
        assert!((tensor[[0, 0, 90, 3]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 0, 3, 90]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_alignment_requires_landmarks() {
        let image = RgbImage::from_pixel(200, 200, Rgb([90, 120, 150]));
        let mut face = BoundingBox {
            x: 50.0, y: 50.0, width: 100.0, height: 100.0,
            confidence: 0.9, landmarks: None,
        };
        let err = FaceRecognizer::aligned_crop(&image, &face).unwrap_err();
        assert!(matches!(err, RecognizerError::NoLandmarks));

        face.landmarks = Some([(85.0, 90.0), (115.0, 90.0), (100.0, 110.0), (88.0, 130.0), (112.0, 130.0)]);
        let crop = FaceRecognizer::aligned_crop(&image, &face).unwrap();
        assert_eq!(crop.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(crop.get_pixel(ALIGNED_SIZE / 2, ALIGNED_SIZE / 2), &Rgb([90, 120, 150]));
    }
}
