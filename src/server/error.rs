//! HTTP-facing errors with stable error codes

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use crate::archive::database::StoreError;
use crate::archive::downloader::DownloadError;
use crate::sites::SiteError;

/// One rejected request field
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self { field: field.to_string(), message: message.into() }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid request")]
    Validation(Vec<FieldError>),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Upstream site error: {0}")]
    Upstream(String),

    #[error("An unexpected error occurred")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "RESOURCE_NOT_FOUND"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::UnsupportedMediaType(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_MEDIA_TYPE")
            }
            ApiError::Upstream(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        match &self {
            ApiError::Internal(detail) => error!("Server error: {}", detail),
            other => info!("Client error: {}", other),
        }

        let details = match &self {
            ApiError::Validation(fields) => json!(fields),
            _ => json!([]),
        };
        let body = json!({ "error": self.to_string(), "code": code, "details": details });
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::UnsupportedSite(url) => {
                ApiError::BadRequest(format!("no adapter for {}", url))
            }
            DownloadError::UnsupportedMediaType(kind) => ApiError::UnsupportedMediaType(kind),
            DownloadError::InvalidUpload(reason) => ApiError::BadRequest(reason),
            DownloadError::Site(SiteError::NotFound(what)) => ApiError::NotFound(what),
            DownloadError::Site(SiteError::InvalidUrl(url)) => {
                ApiError::BadRequest(format!("invalid item URL {}", url))
            }
            DownloadError::Site(e) => ApiError::Upstream(e.to_string()),
            DownloadError::Fetch(e) => ApiError::Upstream(e.to_string()),
            DownloadError::Store(e) => e.into(),
            DownloadError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}
