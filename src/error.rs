//! API-facing error taxonomy and its HTTP mapping.
//!
//! Handlers return [`ApiError`] and let the `IntoResponse` impl pick the
//! status line and JSON body. Store and tracker errors convert losslessly
//! where the caller can act on them (missing records, bad credentials,
//! upstream rejections) and collapse to opaque server failures where they
//! cannot; the detail behind an opaque failure goes to the log, not the
//! client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

use crate::gitlab::TrackerError;
use crate::store::StoreError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Validation(String),
    #[error("sprint is already completed")]
    AlreadyCompleted,
    #[error("missing or invalid credential")]
    Unauthorized,
    /// The tracker answered with a non-success status; both the status and
    /// the upstream body are passed through to the caller.
    #[error("tracker returned {status}")]
    Upstream { status: u16, body: String },
    #[error("tracker unreachable")]
    Gateway(String),
    #[error("OAuth is not configured")]
    OAuthUnconfigured,
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::AlreadyCompleted => StatusCode::CONFLICT,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::Gateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::OAuthUnconfigured => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            ApiError::Upstream { body, .. } => {
                warn!("Passing through tracker failure with status {}", status);
                serde_json::json!({ "error": self.to_string(), "detail": body })
            }
            ApiError::Gateway(detail) => {
                error!("Tracker request failed: {}", detail);
                serde_json::json!({ "error": self.to_string() })
            }
            ApiError::Internal(detail) => {
                error!("Request failed: {}", detail);
                serde_json::json!({ "error": self.to_string() })
            }
            _ => serde_json::json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity } => ApiError::NotFound(entity),
            StoreError::AlreadyCompleted => ApiError::AlreadyCompleted,
            StoreError::Storage { .. } | StoreError::Corruption { .. } => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<TrackerError> for ApiError {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::Auth => ApiError::Unauthorized,
            TrackerError::Remote { status, body } => ApiError::Upstream { status, body },
            TrackerError::Transport(e) => ApiError::Gateway(e.to_string()),
            TrackerError::OAuthUnconfigured => ApiError::OAuthUnconfigured,
        }
    }
}
