//! Model-free detector and embedder used by the daemon's tests.
//!
//! Test images are rows of solid 32×32 tiles. Every tile brighter than
//! black is a "face" and its embedding is the tile's mean colour, so two
//! tiles of the same colour are the same person.

use crate::engine::WorkerModels;
use base64::Engine as _;
use facereg_core::{BoundingBox, Detector, DetectorError, Embedder, Embedding, RecognizerError};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::time::Duration;

pub const TILE: u32 = 32;

pub const RED: [u8; 3] = [200, 20, 20];
pub const GREEN: [u8; 3] = [20, 200, 20];
pub const BLUE: [u8; 3] = [20, 20, 200];

/// Mean brightness below which a tile counts as background.
const BACKGROUND_LEVEL: f32 = 16.0;

fn tile_mean(image: &RgbImage, x0: u32, y0: u32, w: u32, h: u32) -> [f32; 3] {
    let mut sum = [0.0f32; 3];
    let mut n = 0.0f32;
    for y in y0..(y0 + h).min(image.height()) {
        for x in x0..(x0 + w).min(image.width()) {
            let p = image.get_pixel(x, y);
            for c in 0..3 {
                sum[c] += p[c] as f32;
            }
            n += 1.0;
        }
    }
    if n == 0.0 {
        return [0.0; 3];
    }
    sum.map(|s| s / n)
}

/// Reports each non-black tile as a face. Brighter tiles score higher.
pub struct TileDetector;

impl Detector for TileDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyImage);
        }

        let mut faces = Vec::new();
        for ty in 0..image.height() / TILE {
            for tx in 0..image.width() / TILE {
                let (x, y) = (tx * TILE, ty * TILE);
                let mean = tile_mean(image, x, y, TILE, TILE);
                let brightness = (mean[0] + mean[1] + mean[2]) / 3.0;
                if brightness <= BACKGROUND_LEVEL {
                    continue;
                }
                faces.push(BoundingBox {
                    x: x as f32,
                    y: y as f32,
                    width: TILE as f32,
                    height: TILE as f32,
                    confidence: 0.5 + 0.5 * brightness / 255.0,
                    landmarks: None,
                });
            }
        }
        faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(faces)
    }
}

/// Embeds a face as the unit-length mean colour of its box.
pub struct ColorEmbedder;

impl Embedder for ColorEmbedder {
    fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let (x, y, w, h) = face.clamped(image.width(), image.height());
        let mean = tile_mean(image, x, y, w, h);
        Ok(Embedding {
            values: mean.to_vec(),
            model_version: Some("test-color".into()),
        }
        .normalized())
    }
}

/// Sleeps before delegating, to exercise timeouts.
pub struct SlowDetector {
    inner: Box<dyn Detector>,
    delay: Duration,
}

impl SlowDetector {
    pub fn new(inner: Box<dyn Detector>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl Detector for SlowDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        std::thread::sleep(self.delay);
        self.inner.detect(image)
    }
}

pub fn test_models() -> WorkerModels {
    WorkerModels {
        detector: Box::new(TileDetector),
        embedder: Box::new(ColorEmbedder),
    }
}

/// One row of tiles, one per colour.
pub fn color_image(tiles: &[[u8; 3]]) -> RgbImage {
    let width = TILE * tiles.len().max(1) as u32;
    RgbImage::from_fn(width, TILE, |x, _| {
        tiles
            .get((x / TILE) as usize)
            .map(|&c| Rgb(c))
            .unwrap_or(Rgb([0, 0, 0]))
    })
}

/// PNG data URI of `color_image(tiles)`.
pub fn data_uri(tiles: &[[u8; 3]]) -> String {
    png_data_uri(color_image(tiles))
}

/// A black `side`×`side` PNG that takes a while to decode.
pub fn large_data_uri(side: u32) -> String {
    png_data_uri(RgbImage::new(side, side))
}

fn png_data_uri(image: RgbImage) -> String {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buf, ImageFormat::Png)
        .expect("encode test png");
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(buf.into_inner())
    )
}
