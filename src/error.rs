use crate::{decoder::DecodeError, executor::InferenceError, resolver::ModelResolutionError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("confidence_threshold must be between 0 and 1, got {0}")]
    ThresholdOutOfRange(f32),
    #[error("confidence_threshold must be a number, got '{0}'")]
    InvalidThreshold(String),
    #[error("missing multipart field '{0}'")]
    MissingField(&'static str),
    #[error("file must be an image, got content type '{0}'")]
    UnsupportedContentType(String),
    #[error("malformed multipart body: {0}")]
    Multipart(String),
    #[error("upload too large: {0}")]
    PayloadTooLarge(String),
    #[error("at most {max} images can be processed per batch, got {got}")]
    BatchTooLarge { max: usize, got: usize },
}

/// Per-request failure of the detection pipeline.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    ModelResolution(#[from] ModelResolutionError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    detail: String,
}

impl DetectionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DetectionError::Validation(ValidationError::PayloadTooLarge(_)) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            DetectionError::Decode(_) | DetectionError::Validation(_) => StatusCode::BAD_REQUEST,
            DetectionError::ModelResolution(_) => StatusCode::SERVICE_UNAVAILABLE,
            DetectionError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Resolution and inference failures carry paths
    /// and model internals, so those stay in the logs.
    pub fn detail(&self) -> String {
        match self {
            DetectionError::Decode(e) => format!("Invalid image: {}", e),
            DetectionError::Validation(e) => e.to_string(),
            DetectionError::ModelResolution(_) => "No detection model is available".to_string(),
            DetectionError::Inference(_) => "Inference failed for the uploaded image".to_string(),
        }
    }
}

impl IntoResponse for DetectionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::warn!(error = %self, "Rejected request");
        }

        (
            status,
            Json(ErrorBody {
                success: false,
                detail: self.detail(),
            }),
        )
            .into_response()
    }
}
