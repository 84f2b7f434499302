//! HTTP API.
//!
//! Routes:
//! - `GET /health`: load status and device
//! - `POST /predict`: multipart field `file`, or the raw image as the body
//! - `POST /reload`: reload the checkpoint from the configured path; a
//!   checkpoint that cannot be loaded answers 422 and keeps the old model
//!
//! Model work runs on the blocking pool; errors are `{"detail": message}`.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use cxr::infer::{InferError, Pipeline};
use cxr::models::ModelLoadError;
use cxr::InferBackend;

/// Pipeline shared by every handler.
pub type SharedPipeline = Arc<Pipeline<InferBackend>>;

/// Room for multipart boundaries and headers on top of the image itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Name of the multipart field carrying the image.
const UPLOAD_FIELD: &str = "file";

/// Error response with a `{"detail": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl From<InferError> for ApiError {
    fn from(e: InferError) -> Self {
        let status = match &e {
            InferError::ModelNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
            InferError::InvalidImage(_) => StatusCode::BAD_REQUEST,
            InferError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ModelLoadError> for ApiError {
    fn from(e: ModelLoadError) -> Self {
        let status = match &e {
            ModelLoadError::Save(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

/// Build the router around `pipeline`.
pub fn router(pipeline: SharedPipeline) -> Router {
    let body_limit = pipeline.max_image_bytes().saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/health", get(health_handler))
        .route("/predict", post(predict_handler))
        .route("/reload", post(reload_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(pipeline)
}

/// Bind `address` and serve until Ctrl-C.
pub async fn serve(pipeline: SharedPipeline, address: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    tracing::info!(address = %listener.local_addr()?, "listening");

    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn health_handler(State(pipeline): State<SharedPipeline>) -> Response {
    Json(pipeline.registry().health()).into_response()
}

async fn predict_handler(State(pipeline): State<SharedPipeline>, request: Request) -> Response {
    let bytes = match read_upload(request).await {
        Ok(bytes) => bytes,
        Err(e) => return e.into_response(),
    };

    let result = tokio::task::spawn_blocking(move || pipeline.predict(&bytes)).await;
    match result {
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(e)) => {
            if !e.is_client_error() {
                tracing::error!(error = %e, "prediction failed");
            }
            ApiError::from(e).into_response()
        }
        Err(e) => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Prediction task failed: {}", e),
        )
        .into_response(),
    }
}

async fn reload_handler(State(pipeline): State<SharedPipeline>) -> Response {
    let registry = Arc::clone(pipeline.registry());
    let result = tokio::task::spawn_blocking(move || registry.reload()).await;

    match result {
        Ok(Ok(state)) => Json(serde_json::json!({
            "status": "ok",
            "path": state.source().display().to_string(),
            "labels": state.labels(),
            "device": state.device_label(),
        }))
        .into_response(),
        Ok(Err(e)) => ApiError::from(e).into_response(),
        Err(e) => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Reload task failed: {}", e),
        )
        .into_response(),
    }
}

/// Extract the image bytes from a multipart form or a raw body.
async fn read_upload(request: Request) -> Result<Vec<u8>, ApiError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("multipart/form-data"))
        .unwrap_or(false);

    if !is_multipart {
        let body = Bytes::from_request(request, &())
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
        return Ok(body.to_vec());
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ApiError::new(e.status(), e.body_text()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(e.status(), e.body_text()))?
    {
        if field.name() == Some(UPLOAD_FIELD) {
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
            return Ok(data.to_vec());
        }
    }

    Err(ApiError::new(
        StatusCode::BAD_REQUEST,
        format!("Multipart body has no '{}' field", UPLOAD_FIELD),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::Path;

    use axum::body::Body;
    use cxr::all::*;
    use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};

    const SIZE: usize = 32;
    const BOUNDARY: &str = "cxr-test-boundary";

    fn tiny_config() -> EfficientNetConfig {
        EfficientNetConfig::b0(2)
            .with_stem_channels(8)
            .with_stages(vec![
                MbConvStageConfig::new(1, 3, 1, 8, 8, 1),
                MbConvStageConfig::new(2, 3, 2, 8, 16, 1),
            ])
            .with_head_channels(16)
    }

    fn pipeline_for(path: &Path) -> SharedPipeline {
        let options = LoadOptions::default()
            .with_image_size(SIZE)
            .with_device(DeviceSelection::Cpu)
            .with_architecture(tiny_config());
        Arc::new(Pipeline::new(Arc::new(ModelRegistry::new(path, options))))
    }

    fn write_checkpoint(path: &Path) {
        let model: EfficientNet<InferBackend> = tiny_config().init(&Default::default());
        save_model::<InferBackend, _>(&model, path).unwrap();
    }

    fn png_bytes() -> Vec<u8> {
        let image = RgbImage::from_fn(48, 48, |x, y| {
            let v = ((x * 5 + y * 3) % 256) as u8;
            Rgb([v, v, v])
        });
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut cursor, ImageOutputFormat::Png)
            .unwrap();
        cursor.into_inner()
    }

    fn multipart_request(field: &str, payload: &[u8]) -> Request {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"x.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        axum::http::Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn raw_request(payload: Vec<u8>) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/predict")
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(payload))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_for(&dir.path().join("missing.mpk"));

        let response = health_handler(State(pipeline)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"status": "unloaded", "device": "cpu"})
        );
    }

    #[tokio::test]
    async fn test_predict_without_model_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_for(&dir.path().join("missing.mpk"));

        let response = predict_handler(State(pipeline), raw_request(png_bytes())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["detail"], "Model not loaded");
    }

    #[tokio::test]
    async fn test_reload_then_predict_multipart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.mpk");
        let pipeline = pipeline_for(&path);

        let response = reload_handler(State(pipeline.clone())).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let detail = json_body(response).await["detail"].as_str().unwrap().to_string();
        assert!(detail.starts_with("Model file not found"), "{}", detail);

        write_checkpoint(&path);
        let response = reload_handler(State(pipeline.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await["labels"],
            serde_json::json!(["NORMAL", "PNEUMONIA"])
        );

        let response =
            predict_handler(State(pipeline), multipart_request("file", &png_bytes())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let label = body["label"].as_str().unwrap();
        assert!(label == "NORMAL" || label == "PNEUMONIA");
        let probability = body["probability"].as_f64().unwrap();
        assert!((0.5..=1.0).contains(&probability));
        assert!(body["heatmap"].is_string());
    }

    #[tokio::test]
    async fn test_bad_uploads_are_client_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.mpk");
        write_checkpoint(&path);
        let pipeline = pipeline_for(&path);
        pipeline.registry().reload().unwrap();

        let response = predict_handler(
            State(pipeline.clone()),
            raw_request(b"not-an-image".to_vec()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = predict_handler(State(pipeline.clone()), raw_request(Vec::new())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response =
            predict_handler(State(pipeline), multipart_request("image", &png_bytes())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["detail"],
            "Multipart body has no 'file' field"
        );
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError::from(InferError::ModelNotLoaded).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(InferError::InvalidImage(PreprocessError::EmptyPayload)).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(InferError::Backend("nan logits".into())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(ModelLoadError::EmptyLabels).status,
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::from(ModelLoadError::UnsupportedFormat("onnx".into())).status,
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_serving_previous_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.mpk");
        write_checkpoint(&path);
        let pipeline = pipeline_for(&path);
        pipeline.registry().reload().unwrap();

        std::fs::write(&path, b"truncated upload").unwrap();
        let response = reload_handler(State(pipeline.clone())).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let detail = json_body(response).await["detail"].as_str().unwrap().to_string();
        assert!(detail.starts_with("Failed to read checkpoint"), "{}", detail);

        let response = health_handler(State(pipeline)).await;
        assert_eq!(json_body(response).await["status"], "ok");
    }
}
