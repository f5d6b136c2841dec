use crate::{
    detection::{validate_threshold, DetectionRequest, DEFAULT_CONFIDENCE_THRESHOLD},
    error::{DetectionError, ValidationError},
    server::SharedState,
    shaper::DetectionResult,
};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, Query, State,
    },
    http::StatusCode,
    response::Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct IdentifyParams {
    confidence_threshold: Option<String>,
    model_version: Option<String>,
}

#[derive(Serialize)]
pub struct IdentifyResponse {
    success: bool,
    data: DetectionResult,
    message: &'static str,
}

#[derive(Serialize)]
pub struct BatchIdentifyResponse {
    success: bool,
    data: Vec<DetectionResult>,
    processed_count: usize,
    message: String,
}

#[derive(Default)]
struct Upload {
    images: Vec<Bytes>,
    confidence_threshold: Option<String>,
}

#[instrument(skip(state, multipart))]
pub async fn identify(
    State(state): State<SharedState>,
    Query(params): Query<IdentifyParams>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<IdentifyResponse>, DetectionError> {
    state.metrics.record_request("/identify");

    let upload = read_upload(multipart, "image").await?;
    let threshold = resolve_threshold(&params, &upload)?;
    let image = upload
        .images
        .into_iter()
        .next()
        .ok_or(ValidationError::MissingField("image"))?;

    let request =
        DetectionRequest::new(image, threshold).with_version(params.model_version.clone());
    let data = state.detection_service.detect(request).await?;

    Ok(Json(IdentifyResponse {
        success: true,
        data,
        message: "Parts identified successfully",
    }))
}

#[instrument(skip(state, multipart))]
pub async fn batch_identify(
    State(state): State<SharedState>,
    Query(params): Query<IdentifyParams>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<BatchIdentifyResponse>, DetectionError> {
    state.metrics.record_request("/batch-identify");

    let upload = read_upload(multipart, "images").await?;
    let threshold = resolve_threshold(&params, &upload)?;

    if upload.images.is_empty() {
        return Err(ValidationError::MissingField("images").into());
    }
    let max = state.server_config.max_batch_size;
    if upload.images.len() > max {
        return Err(ValidationError::BatchTooLarge {
            max,
            got: upload.images.len(),
        }
        .into());
    }

    let requests = upload
        .images
        .into_iter()
        .map(|image| {
            DetectionRequest::new(image, threshold).with_version(params.model_version.clone())
        })
        .collect();
    let data = state.detection_service.batch_detect(requests).await?;
    let processed_count = data.len();

    Ok(Json(BatchIdentifyResponse {
        success: true,
        data,
        processed_count,
        message: format!("Processed {} images successfully", processed_count),
    }))
}

/// Collects every file under `image_field` plus an optional
/// `confidence_threshold` form field.
async fn read_upload(
    multipart: Result<Multipart, MultipartRejection>,
    image_field: &'static str,
) -> Result<Upload, ValidationError> {
    let mut multipart =
        multipart.map_err(|e| multipart_error(e.status(), e.body_text()))?;
    let mut upload = Upload::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(field_error)?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some(name) if name == image_field => {
                let content_type = field.content_type().unwrap_or_default().to_string();
                if !content_type.starts_with("image/") {
                    return Err(ValidationError::UnsupportedContentType(content_type));
                }
                let data = field
                    .bytes()
                    .await
                    .map_err(field_error)?;
                upload.images.push(data);
            }
            Some("confidence_threshold") => {
                let value = field
                    .text()
                    .await
                    .map_err(field_error)?;
                upload.confidence_threshold = Some(value);
            }
            _ => {}
        }
    }

    Ok(upload)
}

fn field_error(e: MultipartError) -> ValidationError {
    multipart_error(e.status(), e.body_text())
}

/// Body limit overruns surface as 413, everything else as a malformed body.
fn multipart_error(status: StatusCode, detail: String) -> ValidationError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ValidationError::PayloadTooLarge(detail)
    } else {
        ValidationError::Multipart(detail)
    }
}

/// The query parameter wins over the form field.
fn resolve_threshold(params: &IdentifyParams, upload: &Upload) -> Result<f32, ValidationError> {
    let raw = params
        .confidence_threshold
        .as_deref()
        .or(upload.confidence_threshold.as_deref());

    let threshold = match raw {
        Some(value) => value
            .trim()
            .parse::<f32>()
            .map_err(|_| ValidationError::InvalidThreshold(value.to_string()))?,
        None => DEFAULT_CONFIDENCE_THRESHOLD,
    };

    validate_threshold(threshold)
}
