use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are in source-image pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Clamp the box to a `width`×`height` image and round to whole pixels.
    ///
    /// Returns `(x, y, width, height)`. A box entirely outside the image
    /// collapses to zero width or height on the nearest edge.
    pub fn clamped(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let max_x = width as f32;
        let max_y = height as f32;
        let x1 = self.x.clamp(0.0, max_x);
        let y1 = self.y.clamp(0.0, max_y);
        let x2 = (self.x + self.width).clamp(x1, max_x);
        let y2 = (self.y + self.height).clamp(y1, max_y);
        let x = x1.round() as u32;
        let y = y1.round() as u32;
        (
            x,
            y,
            (x2.round() as u32).saturating_sub(x),
            (y2.round() as u32).saturating_sub(y),
        )
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Zero vectors
    /// compare as 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Scale to unit length. Zero vectors are left unchanged.
    pub fn normalized(mut self) -> Self {
        let norm = self.norm();
        if norm > 0.0 {
            for v in self.values.iter_mut() {
                *v /= norm;
            }
        }
        self
    }
}

/// A registered identity and its reference embeddings.
///
/// `embeddings` is never empty for a stored person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub embeddings: Vec<Embedding>,
    pub created_at: String,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Metric distance to the nearest person (`f32::INFINITY` for an empty gallery).
    pub distance: f32,
    /// Match certainty in [0, 100]. Zero when unmatched.
    pub confidence: f32,
    /// ID of the matched person (if any).
    pub person_id: Option<i64>,
    /// Name of the matched person (if any).
    pub name: Option<String>,
}

impl MatchResult {
    /// A non-match at the given distance.
    pub fn unmatched(distance: f32) -> Self {
        Self {
            matched: false,
            distance,
            confidence: 0.0,
            person_id: None,
            name: None,
        }
    }
}

/// One face found in a recognition request.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub matched_name: Option<String>,
    pub person_id: Option<i64>,
    /// In [0, 100].
    pub confidence: f32,
}

/// Outcome of a recognition request: image dimensions plus faces ordered by
/// detector confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub image_width: u32,
    pub image_height: u32,
    pub faces: Vec<DetectedFace>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_unit_length() {
        let e = Embedding::new(vec![3.0, 4.0]).normalized();
        assert!((e.norm() - 1.0).abs() < 1e-6);
        assert!((e.values[0] - 0.6).abs() < 1e-6);

        let zero = Embedding::new(vec![0.0, 0.0]).normalized();
        assert_eq!(zero.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_bbox_clamped_inside() {
        let b = BoundingBox {
            x: 10.4, y: 20.6, width: 30.0, height: 40.0,
            confidence: 0.9, landmarks: None,
        };
        assert_eq!(b.clamped(100, 100), (10, 21, 30, 40));
    }

    #[test]
    fn test_bbox_clamped_overhanging() {
        let b = BoundingBox {
            x: -5.0, y: 90.0, width: 20.0, height: 20.0,
            confidence: 0.9, landmarks: None,
        };
        assert_eq!(b.clamped(100, 100), (0, 90, 15, 10));
    }

    #[test]
    fn test_bbox_clamped_outside() {
        let b = BoundingBox {
            x: 150.0, y: 10.0, width: 20.0, height: 20.0,
            confidence: 0.9, landmarks: None,
        };
        let (x, _, w, _) = b.clamped(100, 100);
        assert_eq!((x, w), (100, 0));
    }
}
