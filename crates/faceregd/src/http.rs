//! REST surface.
//!
//! - GET    /get_persons          - registered persons, ordered by name
//! - POST   /recognize_faces      - {image} → boxes + names + confidence
//! - POST   /register_face        - {name, image}
//! - PUT    /update_person/{id}   - {name}
//! - DELETE /delete_person/{id}
//! - GET    /status               - daemon and matcher settings

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, PathRejection},
        DefaultBodyLimit, FromRequest, FromRequestParts, State,
    },
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use facereg_core::DetectedFace;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::service::{FaceService, ServiceError};

/// Name reported for faces that match nobody.
const UNKNOWN_NAME: &str = "Unknown";

/// JSON body extractor whose rejections use the `{error}` shape.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct ApiJson<T>(T);

/// Path extractor with the same rejection shape.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
struct ApiPath<T>(T);

/// Error response: `{"error": "<message>"}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::InvalidRequest(_) | ServiceError::Decode(_) => StatusCode::BAD_REQUEST,
            ServiceError::NoFaceDetected => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::DuplicateName(_) => StatusCode::CONFLICT,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        } else {
            tracing::debug!(error = %err, status = status.as_u16(), "request rejected");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let status = match rejection {
            JsonRejection::BytesRejection(_) => rejection.status(),
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: rejection.body_text(),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct RecognizeRequest {
    #[serde(default)]
    image: String,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    image: String,
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
struct PersonDto {
    id: i64,
    name: String,
    embeddings: usize,
    created_at: String,
}

#[derive(Debug, Serialize)]
struct FaceDto {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    name: String,
    matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    person_id: Option<i64>,
    confidence: f32,
}

impl From<DetectedFace> for FaceDto {
    fn from(face: DetectedFace) -> Self {
        Self {
            x: face.x,
            y: face.y,
            width: face.width,
            height: face.height,
            matched: face.matched_name.is_some(),
            name: face.matched_name.unwrap_or_else(|| UNKNOWN_NAME.to_string()),
            person_id: face.person_id,
            confidence: face.confidence,
        }
    }
}

#[derive(Debug, Serialize)]
struct RecognizeResponse {
    image_width: u32,
    image_height: u32,
    faces: Vec<FaceDto>,
}

type AppState = Arc<FaceService>;

/// Build the application router.
pub fn router(service: Arc<FaceService>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/get_persons", get(get_persons))
        .route("/recognize_faces", post(recognize_faces))
        .route("/register_face", post(register_face))
        .route("/update_person/{id}", put(update_person))
        .route("/delete_person/{id}", delete(delete_person))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                tracing::info_span!(
                    "request",
                    id = %uuid::Uuid::new_v4(),
                    method = %req.method(),
                    path = %req.uri().path(),
                )
            }),
        )
        .with_state(service)
}

async fn get_persons(State(svc): State<AppState>) -> impl IntoResponse {
    let persons: Vec<PersonDto> = svc
        .persons()
        .into_iter()
        .map(|p| PersonDto {
            id: p.id,
            embeddings: p.embeddings.len(),
            name: p.name,
            created_at: p.created_at,
        })
        .collect();
    Json(persons)
}

async fn recognize_faces(
    State(svc): State<AppState>,
    ApiJson(req): ApiJson<RecognizeRequest>,
) -> Result<Json<RecognizeResponse>, ApiError> {
    let result = svc.recognize(req.image).await?;
    Ok(Json(RecognizeResponse {
        image_width: result.image_width,
        image_height: result.image_height,
        faces: result.faces.into_iter().map(FaceDto::from).collect(),
    }))
}

async fn register_face(
    State(svc): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reg = svc.register(&req.name, req.image).await?;
    Ok(Json(json!({
        "success": true,
        "id": reg.id,
        "name": reg.name,
        "merged": reg.merged,
    })))
}

async fn update_person(
    State(svc): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let person = svc.rename(id, &req.name).await?;
    Ok(Json(json!({ "success": true, "id": person.id, "name": person.name })))
}

async fn delete_person(
    State(svc): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    svc.delete(id).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

async fn status(State(svc): State<AppState>) -> impl IntoResponse {
    let s = svc.status();
    Json(json!({
        "version": s.version,
        "persons": s.persons,
        "workers": s.workers,
        "metric": s.metric,
        "threshold": s.threshold,
        "duplicate_names": s.duplicate_names,
    }))
}
