use facereg_core::{BoundingBox, Detector, DetectorError, Embedder, Embedding, RecognizerError};
use image::RgbImage;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Requests queued per worker before `analyze` callers wait for a slot.
const QUEUE_DEPTH_PER_WORKER: usize = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("failed to spawn engine worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine workers exited")]
    ChannelClosed,
}

/// The model pair owned by one worker thread.
pub struct WorkerModels {
    pub detector: Box<dyn Detector>,
    pub embedder: Box<dyn Embedder>,
}

/// One detected face together with its embedding.
#[derive(Debug, Clone)]
pub struct FaceAnalysis {
    pub face: BoundingBox,
    pub embedding: Embedding,
}

/// Messages sent from request handlers to the worker pool.
enum EngineRequest {
    Analyze {
        image: Arc<RgbImage>,
        reply: oneshot::Sender<Result<Vec<FaceAnalysis>, EngineError>>,
    },
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    workers: usize,
}

impl EngineHandle {
    /// Detect faces in `image` and embed each one.
    ///
    /// Faces come back in detector order (highest confidence first).
    pub async fn analyze(&self, image: Arc<RgbImage>) -> Result<Vec<FaceAnalysis>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

/// Spawn `workers` engine threads.
///
/// `factory` is called once per worker, on the calling thread, so a model
/// that fails to load aborts startup before any thread is running.
pub fn spawn_engine<F>(workers: usize, max_faces: usize, factory: F) -> Result<EngineHandle, EngineError>
where
    F: Fn(usize) -> Result<WorkerModels, EngineError>,
{
    let mut models = Vec::with_capacity(workers);
    for index in 0..workers {
        models.push(factory(index)?);
        tracing::info!(worker = index, "engine worker models loaded");
    }

    let (tx, rx) = mpsc::channel::<EngineRequest>(workers.max(1) * QUEUE_DEPTH_PER_WORKER);
    let rx = Arc::new(Mutex::new(rx));

    for (index, mut worker) in models.into_iter().enumerate() {
        let rx = Arc::clone(&rx);
        std::thread::Builder::new()
            .name(format!("facereg-engine-{index}"))
            .spawn(move || {
                tracing::info!(worker = index, "engine thread started");
                while let Some(req) = next_request(&rx) {
                    match req {
                        EngineRequest::Analyze { image, reply } => {
                            let result = run_analyze(&mut worker, &image, max_faces);
                            // Receiver gone means the caller timed out.
                            let _ = reply.send(result);
                        }
                    }
                }
                tracing::info!(worker = index, "engine thread exiting");
            })?;
    }

    Ok(EngineHandle { tx, workers })
}

/// Take the next request off the shared queue. Returns `None` once every
/// handle is dropped.
fn next_request(rx: &Mutex<mpsc::Receiver<EngineRequest>>) -> Option<EngineRequest> {
    let mut guard = match rx.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.blocking_recv()
}

/// Detect, cap at `max_faces`, and embed every remaining face.
fn run_analyze(
    models: &mut WorkerModels,
    image: &RgbImage,
    max_faces: usize,
) -> Result<Vec<FaceAnalysis>, EngineError> {
    let mut faces = models.detector.detect(image)?;
    if faces.len() > max_faces {
        tracing::debug!(detected = faces.len(), kept = max_faces, "capping faces per image");
        faces.truncate(max_faces);
    }

    faces
        .into_iter()
        .map(|face| {
            let embedding = models.embedder.extract(image, &face)?;
            Ok(FaceAnalysis { face, embedding })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{color_image, test_models, SlowDetector, BLUE, GREEN, RED};
    use std::time::Duration;

    #[tokio::test]
    async fn test_analyze_embeds_every_face() {
        let engine = spawn_engine(1, 20, |_| Ok(test_models())).unwrap();
        let image = Arc::new(color_image(&[RED, [0, 0, 0], GREEN]));

        let faces = engine.analyze(image).await.unwrap();
        assert_eq!(faces.len(), 2);
        for analysis in &faces {
            assert!((analysis.embedding.norm() - 1.0).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn test_analyze_empty_image() {
        let engine = spawn_engine(1, 20, |_| Ok(test_models())).unwrap();
        let faces = engine.analyze(Arc::new(color_image(&[[0, 0, 0]]))).await.unwrap();
        assert!(faces.is_empty());
    }

    #[tokio::test]
    async fn test_max_faces_cap() {
        let engine = spawn_engine(1, 2, |_| Ok(test_models())).unwrap();
        let faces = engine
            .analyze(Arc::new(color_image(&[RED, GREEN, BLUE])))
            .await
            .unwrap();
        assert_eq!(faces.len(), 2);
    }

    #[tokio::test]
    async fn test_factory_failure_aborts_startup() {
        let result = spawn_engine(3, 20, |index| {
            if index == 2 {
                Err(EngineError::Detector(DetectorError::ModelNotFound("det_10g.onnx".into())))
            } else {
                Ok(test_models())
            }
        });
        assert!(matches!(result, Err(EngineError::Detector(_))));
    }

    #[tokio::test]
    async fn test_workers_serve_concurrently() {
        let delay = Duration::from_millis(200);
        let engine = spawn_engine(2, 20, move |_| {
            let mut models = test_models();
            models.detector = Box::new(SlowDetector::new(models.detector, delay));
            Ok(models)
        })
        .unwrap();
        assert_eq!(engine.workers(), 2);

        let image = Arc::new(color_image(&[RED]));
        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(engine.analyze(image.clone()), engine.analyze(image));
        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap().len(), 1);
        // Two workers: both requests overlap instead of queueing.
        assert!(started.elapsed() < delay * 2);
    }
}
