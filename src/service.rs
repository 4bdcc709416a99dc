use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use image::DynamicImage;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::{DetectResponse, JpegImage, Pipeline, decode_image};
use crate::registry::ModelKind;

/// Shared state of every handler.
pub struct AppState {
    pipeline: Arc<Pipeline>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl AppState {
    pub fn new(pipeline: Pipeline, workers: usize, timeout: Duration) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("no image file in the upload")]
    MissingUpload,
    #[error("malformed multipart upload: {0}")]
    Multipart(String),
    #[error("upload exceeds the size limit")]
    PayloadTooLarge,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("inference did not finish within {0:?}")]
    Timeout(Duration),
    #[error("inference worker failed: {0}")]
    Worker(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingUpload | AppError::Multipart(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Pipeline(PipelineError::Decode(_)) => StatusCode::BAD_REQUEST,
            AppError::Pipeline(PipelineError::ModelLoad(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Pipeline(_) | AppError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Message safe to show to the client.
    fn public_message(&self) -> String {
        match self {
            AppError::Pipeline(e @ PipelineError::ModelLoad(_)) => match e.model_kind() {
                Some(kind) => format!("{kind} model is unavailable"),
                None => "model is unavailable".to_string(),
            },
            AppError::Pipeline(PipelineError::Inference(_)) => "inference failed".to_string(),
            AppError::Pipeline(PipelineError::Encode(_)) => "failed to encode the result image".to_string(),
            AppError::Worker(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(e: MultipartError) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge
        } else {
            AppError::Multipart(e.body_text())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.public_message() }))).into_response()
    }
}

impl IntoResponse for JpegImage {
    fn into_response(self) -> Response {
        ([(header::CONTENT_TYPE, JpegImage::CONTENT_TYPE)], self.0).into_response()
    }
}

pub fn router(state: Arc<AppState>, body_limit: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/detect", post(detect))
        .route("/detect_with_gradcam", post(detect_with_gradcam))
        .route("/detect_with_boxes", post(detect_with_boxes))
        .route("/detect_with_combined_heatmap", post(detect_with_combined_heatmap))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({ "message": "Image Detection API" }))
}

/// Slot state of every model, plus the reason of each failed load.
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let registry = state.pipeline.registry();
    let mut models = serde_json::Map::new();
    let mut failures = serde_json::Map::new();
    for kind in ModelKind::ALL {
        models.insert(kind.name().to_string(), json!(registry.status(kind)));
        if let Some(reason) = registry.last_failure(kind) {
            failures.insert(kind.name().to_string(), json!(reason));
        }
    }
    Json(json!({ "status": "ok", "models": models, "failures": failures }))
}

async fn detect(State(state): State<Arc<AppState>>, multipart: Multipart) -> Result<Json<DetectResponse>, AppError> {
    let response = run(&state, "detect", multipart, |pipeline, image| pipeline.detect_and_classify(image)).await?;
    Ok(Json(response))
}

async fn detect_with_gradcam(State(state): State<Arc<AppState>>, multipart: Multipart) -> Result<JpegImage, AppError> {
    run(&state, "detect_with_gradcam", multipart, |pipeline, image| pipeline.gradcam(image)).await
}

async fn detect_with_boxes(State(state): State<Arc<AppState>>, multipart: Multipart) -> Result<JpegImage, AppError> {
    run(&state, "detect_with_boxes", multipart, |pipeline, image| pipeline.annotated(image)).await
}

async fn detect_with_combined_heatmap(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<JpegImage, AppError> {
    run(&state, "detect_with_combined_heatmap", multipart, |pipeline, image| {
        pipeline.combined_heatmap(image)
    })
    .await
}

/// Takes the part named `file`, or else the first part carrying a filename.
async fn read_upload(mut multipart: Multipart) -> Result<Bytes, AppError> {
    let mut fallback = None;
    while let Some(field) = multipart.next_field().await? {
        let named_file = field.name() == Some("file");
        if named_file || (fallback.is_none() && field.file_name().is_some()) {
            let data = field.bytes().await?;
            if named_file {
                return Ok(data);
            }
            fallback = Some(data);
        }
    }
    fallback.ok_or(AppError::MissingUpload)
}

/// Decodes the upload and runs `job` on a blocking worker, bounded by the
/// worker permits and the request timeout.
async fn run<T, F>(state: &AppState, operation: &'static str, multipart: Multipart, job: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&Pipeline, &DynamicImage) -> Result<T, PipelineError> + Send + 'static,
{
    let bytes = read_upload(multipart).await.inspect_err(|e| {
        warn!(operation, error = %e, "rejected upload");
    })?;
    info!(operation, bytes = bytes.len(), "request received");

    let pipeline = state.pipeline.clone();
    let permits = state.permits.clone();
    let work = async move {
        let permit = permits
            .acquire_owned()
            .await
            .map_err(|e| AppError::Worker(e.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let image = decode_image(&bytes).map_err(|e| (PipelineError::from(e), None))?;
            let dims = (image.width(), image.height());
            job(&pipeline, &image).map_err(|e| (e, Some(dims)))
        })
        .await
        .map_err(|e| AppError::Worker(e.to_string()))
    };

    match tokio::time::timeout(state.timeout, work).await {
        Err(_) => {
            error!(operation, timeout = ?state.timeout, "request timed out");
            Err(AppError::Timeout(state.timeout))
        }
        Ok(Err(e)) => {
            error!(operation, error = %e, "inference worker failed");
            Err(e)
        }
        Ok(Ok(Err((e, dims)))) => {
            let (width, height) = dims.unwrap_or((0, 0));
            let model = e.model_kind().map(|kind| kind.name());
            match &e {
                PipelineError::Decode(_) => warn!(operation, error = %e, "undecodable upload"),
                _ => error!(operation, width, height, model, error = %e, "request failed"),
            }
            Err(AppError::Pipeline(e))
        }
        Ok(Ok(Ok(value))) => Ok(value),
    }
}
