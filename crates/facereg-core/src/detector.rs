//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model on RGB photos: letterbox to 640×640, 3-stride anchor
//! decoding with five landmarks per face, then NMS.

use crate::types::BoundingBox;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download from insightface and place in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty image")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces in an RGB image.
///
/// Implementations return boxes in source-image pixels, sorted by
/// confidence, highest first. An image without faces yields an empty vec.
pub trait Detector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl LetterboxInfo {
    /// Map a point in model-input pixels back to the source image.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Raw SCRFD outputs for one stride level.
struct StrideOutputs<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_height: usize,
    input_width: usize,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        // Discover output ordering by name. SCRFD exports may name tensors as:
        //   "score_8", "score_16", "score_32" / "bbox_8", "bbox_16", "bbox_32" / "kps_8", ...
        // or as generic integers ("428", "429", ...).
        // Fall back to standard positional ordering when names are not recognized.
        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            stride_indices,
        })
    }

    fn run(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyImage);
        }
        let (input, letterbox) = letterbox_tensor(image, self.input_width, self.input_height);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            let out = StrideOutputs { stride, scores, bboxes, kps };
            detections.extend(decode_stride(
                &out,
                (self.input_width, self.input_height),
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(nms(detections, SCRFD_NMS_THRESHOLD))
    }
}

impl Detector for FaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let faces = self.run(image)?;
        tracing::debug!(
            faces = faces.len(),
            width = image.width(),
            height = image.height(),
            "SCRFD detection"
        );
        Ok(faces)
    }
}

/// Compute the letterbox fit of a `width`×`height` image into the model input.
fn letterbox_fit(width: usize, height: usize, input_width: usize, input_height: usize) -> (LetterboxInfo, usize, usize) {
    let scale_w = input_width as f32 / width as f32;
    let scale_h = input_height as f32 / height as f32;
    let scale = scale_w.min(scale_h);

    let new_w = ((width as f32 * scale).round() as usize).clamp(1, input_width);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, input_height);
    let pad_x = (input_width - new_w) as f32 / 2.0;
    let pad_y = (input_height - new_h) as f32 / 2.0;

    (LetterboxInfo { scale, pad_x, pad_y }, new_w, new_h)
}

/// Resize an RGB image with bilinear interpolation.
fn resize_bilinear(image: &RgbImage, new_w: usize, new_h: usize, inv_scale: f32) -> Vec<[u8; 3]> {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let raw = image.as_raw();
    let px = |x: usize, y: usize, c: usize| raw[(y * width + x) * 3 + c] as f32;

    let mut resized = vec![[0u8; 3]; new_w * new_h];
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
        let y0 = (src_y.floor() as i64).clamp(0, height as i64 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
            let x0 = (src_x.floor() as i64).clamp(0, width as i64 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let out = &mut resized[y * new_w + x];
            for (c, channel) in out.iter_mut().enumerate() {
                let val = px(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                    + px(x1, y0, c) * fx * (1.0 - fy)
                    + px(x0, y1, c) * (1.0 - fx) * fy
                    + px(x1, y1, c) * fx * fy;
                *channel = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    resized
}

/// Build the NCHW RGB input tensor with letterbox padding.
///
/// Padding uses `SCRFD_MEAN`, which normalizes to 0.0.
fn letterbox_tensor(image: &RgbImage, input_width: usize, input_height: usize) -> (Array4<f32>, LetterboxInfo) {
    let (letterbox, new_w, new_h) = letterbox_fit(
        image.width() as usize,
        image.height() as usize,
        input_width,
        input_height,
    );
    let resized = resize_bilinear(image, new_w, new_h, 1.0 / letterbox.scale);

    let pad_x_start = letterbox.pad_x.floor() as usize;
    let pad_y_start = letterbox.pad_y.floor() as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, input_height, input_width));
    for y in 0..new_h {
        for x in 0..new_w {
            let rgb = resized[y * new_w + x];
            for c in 0..3 {
                tensor[[0, c, y + pad_y_start, x + pad_x_start]] =
                    (rgb[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }

    (tensor, letterbox)
}

/// Discover output tensor ordering by name.
///
/// SCRFD models may export tensors with named outputs ("score_8", "bbox_16", ...) or
/// generic numeric names. If named pattern is detected, maps them to stride slots.
/// Otherwise falls back to the standard positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
///   [6-8] = kps    (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named.as_deref() {
        Some(&[s8, s16, s32]) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [s8, s16, s32]
        }
        _ => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes, [6-8]=kps"
            );
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode the anchors of one stride scoring above `threshold` into
/// source-image boxes with landmarks.
fn decode_stride(
    out: &StrideOutputs,
    input: (usize, usize),
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let (input_width, input_height) = input;
    let grid_w = input_width / out.stride;
    let anchors = grid_w * (input_height / out.stride) * SCRFD_ANCHORS_PER_CELL;
    let step = out.stride as f32;

    out.scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let (ax, ay) = ((cell % grid_w) as f32 * step, (cell / grid_w) as f32 * step);

            // Distances from the anchor to the left, top, right and bottom edges.
            let d = out.bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.to_source(ax - d[0] * step, ay - d[1] * step);
            let (x2, y2) = letterbox.to_source(ax + d[2] * step, ay + d[3] * step);

            let landmarks = out.kps.get(idx * 10..idx * 10 + 10).map(|kps| {
                std::array::from_fn(|i| letterbox.to_source(ax + kps[2 * i] * step, ay + kps[2 * i + 1] * step))
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy NMS. Boxes are taken best-first and kept unless they overlap an
/// already kept box by more than `iou_threshold`. The result stays sorted.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::with_capacity(detections.len());
    for face in detections {
        if keep.iter().all(|kept| iou(kept, &face) <= iou_threshold) {
            keep.push(face);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap = |a0: f32, a1: f32, b0: f32, b1: f32| (a1.min(b1) - a0.max(b0)).max(0.0);
    let inter = overlap(a.x, a.x + a.width, b.x, b.x + b.width)
        * overlap(a.y, a.y + a.height, b.y, b.y + b.height);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
