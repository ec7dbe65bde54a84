use crate::engine::{EngineError, EngineHandle, FaceAnalysis};
use crate::store::{DuplicatePolicy, PersonStore, StoreError};
use facereg_core::{
    decode_image, DetectedFace, IngestError, IngestLimits, MatchMetric, Matcher, Person,
    RecognitionResult,
};
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("invalid image: {0}")]
    Decode(#[from] IngestError),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("a person named {0:?} already exists")]
    DuplicateName(String),
    #[error("person {0} not found")]
    NotFound(i64),
    #[error("{stage} timed out after {}ms", .after.as_millis())]
    Timeout { stage: &'static str, after: Duration },
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::EmptyName | StoreError::NameTooLong => {
                ServiceError::InvalidRequest(err.to_string())
            }
            StoreError::DuplicateName(name) => ServiceError::DuplicateName(name),
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub id: i64,
    pub name: String,
    pub merged: bool,
}

#[derive(Debug, Clone)]
pub struct Status {
    pub version: &'static str,
    pub persons: usize,
    pub workers: usize,
    pub metric: MatchMetric,
    pub threshold: f32,
    pub duplicate_names: DuplicatePolicy,
}

/// Matching parameters and per-stage timeouts.
#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    pub metric: MatchMetric,
    pub threshold: f32,
    pub limits: IngestLimits,
    pub decode_timeout: Duration,
    pub detect_timeout: Duration,
}

/// Ingestion → engine → matcher / store.
pub struct FaceService {
    engine: EngineHandle,
    store: Arc<PersonStore>,
    matcher: Box<dyn Matcher>,
    options: ServiceOptions,
}

impl FaceService {
    pub fn new(engine: EngineHandle, store: Arc<PersonStore>, options: ServiceOptions) -> Self {
        Self {
            engine,
            store,
            matcher: options.metric.matcher(),
            options,
        }
    }

    /// Find every face in `image` and match each against the gallery.
    ///
    /// An image without faces is a successful, empty result.
    pub async fn recognize(&self, image: String) -> Result<RecognitionResult, ServiceError> {
        let image = self.decode(image).await?;
        let analyses = self.analyze(Arc::clone(&image)).await?;

        // One snapshot for the whole request.
        let gallery = self.store.list();
        let (width, height) = image.dimensions();

        let faces: Vec<DetectedFace> = analyses
            .iter()
            .map(|analysis| {
                let result = self
                    .matcher
                    .compare(&analysis.embedding, &gallery, self.options.threshold);
                let (x, y, w, h) = analysis.face.clamped(width, height);
                DetectedFace {
                    x,
                    y,
                    width: w,
                    height: h,
                    matched_name: result.name,
                    person_id: result.person_id,
                    confidence: result.confidence.clamp(0.0, 100.0),
                }
            })
            .collect();

        tracing::info!(
            width,
            height,
            faces = faces.len(),
            matched = faces.iter().filter(|f| f.matched_name.is_some()).count(),
            gallery = gallery.len(),
            "recognize"
        );

        Ok(RecognitionResult {
            image_width: width,
            image_height: height,
            faces,
        })
    }

    /// Register the highest-confidence face in `image` under `name`.
    pub async fn register(&self, name: &str, image: String) -> Result<Registration, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("name is required".into()));
        }

        let image = self.decode(image).await?;
        let analyses = self.analyze(image).await?;

        let best = analyses
            .into_iter()
            .max_by(|a, b| a.face.confidence.total_cmp(&b.face.confidence))
            .ok_or(ServiceError::NoFaceDetected)?;
        tracing::debug!(confidence = best.face.confidence, "register: best face selected");

        let created = self.store.create(name, best.embedding).await?;
        Ok(Registration {
            id: created.id,
            name: created.name,
            merged: created.merged,
        })
    }

    /// Rename person `id` and return the updated record.
    pub async fn rename(&self, id: i64, name: &str) -> Result<Person, ServiceError> {
        self.store.rename(id, name).await?;
        self.store.get(id).ok_or(ServiceError::NotFound(id))
    }

    pub async fn delete(&self, id: i64) -> Result<(), ServiceError> {
        Ok(self.store.delete(id).await?)
    }

    /// All persons ordered by name (case-insensitive), then id.
    pub fn persons(&self) -> Vec<Person> {
        let mut persons = self.store.list().as_ref().clone();
        persons.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then(a.id.cmp(&b.id))
        });
        persons
    }

    pub fn status(&self) -> Status {
        Status {
            version: env!("CARGO_PKG_VERSION"),
            persons: self.store.len(),
            workers: self.engine.workers(),
            metric: self.matcher.metric(),
            threshold: self.options.threshold,
            duplicate_names: self.store.policy(),
        }
    }

    /// Decode on the blocking pool, bounded by `decode_timeout`.
    async fn decode(&self, image: String) -> Result<Arc<RgbImage>, ServiceError> {
        if image.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("image is required".into()));
        }

        let limits = self.options.limits;
        let after = self.options.decode_timeout;
        let task = tokio::task::spawn_blocking(move || decode_image(&image, &limits));

        let decoded = tokio::time::timeout(after, task)
            .await
            .map_err(|_| ServiceError::Timeout {
                stage: "image decoding",
                after,
            })?
            .map_err(|e| ServiceError::Internal(format!("decode task failed: {e}")))??;

        Ok(Arc::new(decoded.rgb))
    }

    /// Detect and embed, bounded by `detect_timeout`.
    async fn analyze(&self, image: Arc<RgbImage>) -> Result<Vec<FaceAnalysis>, ServiceError> {
        let after = self.options.detect_timeout;
        let analyses = tokio::time::timeout(after, self.engine.analyze(image))
            .await
            .map_err(|_| {
                tracing::warn!(timeout_ms = after.as_millis() as u64, "face analysis timed out");
                ServiceError::Timeout {
                    stage: "face detection",
                    after,
                }
            })??;
        Ok(analyses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::testutil::{data_uri, large_data_uri, test_models, SlowDetector, BLUE, GREEN, RED, TILE};

    fn options() -> ServiceOptions {
        ServiceOptions {
            metric: MatchMetric::Cosine,
            threshold: MatchMetric::Cosine.default_threshold(),
            limits: IngestLimits::default(),
            decode_timeout: Duration::from_secs(2),
            detect_timeout: Duration::from_secs(5),
        }
    }

    async fn service_with(policy: DuplicatePolicy, options: ServiceOptions) -> FaceService {
        let engine = spawn_engine(2, 20, |_| Ok(test_models())).unwrap();
        let store = Arc::new(PersonStore::open_in_memory(policy).await.unwrap());
        FaceService::new(engine, store, options)
    }

    async fn service() -> FaceService {
        service_with(DuplicatePolicy::Reject, options()).await
    }

    #[tokio::test]
    async fn test_registered_face_is_recognized() {
        let svc = service().await;
        let reg = svc.register("Alice", data_uri(&[RED])).await.unwrap();
        svc.register("Bob", data_uri(&[GREEN])).await.unwrap();

        let result = svc.recognize(data_uri(&[[0, 0, 0], RED])).await.unwrap();
        assert_eq!((result.image_width, result.image_height), (2 * TILE, TILE));
        assert_eq!(result.faces.len(), 1);

        let face = &result.faces[0];
        assert_eq!(face.matched_name.as_deref(), Some("Alice"));
        assert_eq!(face.person_id, Some(reg.id));
        assert_eq!((face.x, face.y, face.width, face.height), (TILE, 0, TILE, TILE));
        assert!(face.confidence >= svc.options.threshold * 100.0);
        assert!(face.confidence <= 100.0);
    }

    #[tokio::test]
    async fn test_unknown_face_and_empty_gallery() {
        let svc = service().await;
        let result = svc.recognize(data_uri(&[BLUE])).await.unwrap();
        assert_eq!(result.faces.len(), 1);
        assert!(result.faces[0].matched_name.is_none());
        assert_eq!(result.faces[0].confidence, 0.0);

        svc.register("Alice", data_uri(&[RED])).await.unwrap();
        let result = svc.recognize(data_uri(&[BLUE])).await.unwrap();
        assert!(result.faces[0].matched_name.is_none());
    }

    #[tokio::test]
    async fn test_zero_faces_is_empty_result() {
        let svc = service().await;
        let result = svc.recognize(data_uri(&[[0, 0, 0], [0, 0, 0]])).await.unwrap();
        assert!(result.faces.is_empty());
        assert_eq!(result.image_width, 2 * TILE);
    }

    #[tokio::test]
    async fn test_delete_then_recognize_is_unmatched() {
        let svc = service().await;
        let id = svc.register("Alice", data_uri(&[RED])).await.unwrap().id;
        svc.delete(id).await.unwrap();

        let result = svc.recognize(data_uri(&[RED])).await.unwrap();
        assert!(result.faces[0].matched_name.is_none());
        assert!(matches!(svc.delete(id).await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_register_errors() {
        let svc = service().await;
        assert!(matches!(
            svc.register("Alice", data_uri(&[[0, 0, 0]])).await,
            Err(ServiceError::NoFaceDetected)
        ));
        assert!(matches!(
            svc.register("  ", data_uri(&[RED])).await,
            Err(ServiceError::InvalidRequest(_))
        ));
        assert!(matches!(
            svc.register("Alice", "data:image/png;base64,AAAA".into()).await,
            Err(ServiceError::Decode(_))
        ));
        assert!(matches!(
            svc.register("Alice", String::new()).await,
            Err(ServiceError::InvalidRequest(_))
        ));

        svc.register("Alice", data_uri(&[RED])).await.unwrap();
        assert!(matches!(
            svc.register("Alice", data_uri(&[GREEN])).await,
            Err(ServiceError::DuplicateName(_))
        ));
    }

    #[tokio::test]
    async fn test_register_uses_highest_confidence_face() {
        let svc = service().await;
        // The tile detector scores brighter tiles higher.
        let dim = [60, 10, 10];
        let bright = [20, 240, 240];
        svc.register("Cyan", data_uri(&[dim, bright])).await.unwrap();

        let result = svc.recognize(data_uri(&[bright])).await.unwrap();
        assert_eq!(result.faces[0].matched_name.as_deref(), Some("Cyan"));
    }

    #[tokio::test]
    async fn test_merge_policy_adds_embedding() {
        let svc = service_with(DuplicatePolicy::Merge, options()).await;
        let first = svc.register("Alice", data_uri(&[RED])).await.unwrap();
        let second = svc.register("Alice", data_uri(&[GREEN])).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.merged);

        let result = svc.recognize(data_uri(&[GREEN])).await.unwrap();
        assert_eq!(result.faces[0].person_id, Some(first.id));
    }

    #[tokio::test]
    async fn test_persons_sorted_by_name() {
        let svc = service().await;
        svc.register("carol", data_uri(&[RED])).await.unwrap();
        svc.register("Bob", data_uri(&[GREEN])).await.unwrap();
        svc.register("alice", data_uri(&[BLUE])).await.unwrap();

        let names: Vec<_> = svc.persons().into_iter().map(|p| p.name).collect();
        assert_eq!(names, ["alice", "Bob", "carol"]);
        assert_eq!(svc.status().persons, 3);
    }

    #[tokio::test]
    async fn test_rename_twice_same_state() {
        let svc = service().await;
        let id = svc.register("Alice", data_uri(&[RED])).await.unwrap().id;
        assert_eq!(svc.rename(id, " Alicia ").await.unwrap().name, "Alicia");
        let again = svc.rename(id, "Alicia").await.unwrap();
        assert_eq!((again.id, again.name.as_str()), (id, "Alicia"));
        assert_eq!(again.embeddings.len(), 1);

        let result = svc.recognize(data_uri(&[RED])).await.unwrap();
        assert_eq!(result.faces[0].matched_name.as_deref(), Some("Alicia"));
        assert!(matches!(svc.rename(404, "X").await, Err(ServiceError::NotFound(404))));
    }

    #[tokio::test]
    async fn test_detection_timeout() {
        let options = ServiceOptions {
            detect_timeout: Duration::from_millis(50),
            ..options()
        };
        let engine = spawn_engine(1, 20, |_| {
            let mut models = test_models();
            models.detector = Box::new(SlowDetector::new(models.detector, Duration::from_millis(500)));
            Ok(models)
        })
        .unwrap();
        let store = Arc::new(PersonStore::open_in_memory(DuplicatePolicy::Reject).await.unwrap());
        let svc = FaceService::new(engine, store, options);

        let err = svc.recognize(data_uri(&[RED])).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout { stage: "face detection", .. }), "{err}");
    }

    #[tokio::test]
    async fn test_decode_timeout() {
        let options = ServiceOptions {
            decode_timeout: Duration::ZERO,
            ..options()
        };
        let svc = service_with(DuplicatePolicy::Reject, options).await;

        let err = svc.recognize(large_data_uri(2048)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout { stage: "image decoding", .. }), "{err}");
        let err = svc.register("Alice", large_data_uri(2048)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout { stage: "image decoding", .. }), "{err}");
        assert_eq!(svc.store.len(), 0);
    }

    #[tokio::test]
    async fn test_status() {
        let svc = service().await;
        let status = svc.status();
        assert_eq!(status.workers, 2);
        assert_eq!(status.metric, MatchMetric::Cosine);
        assert_eq!(status.duplicate_names, DuplicatePolicy::Reject);
        assert_eq!(status.persons, 0);
    }
}
