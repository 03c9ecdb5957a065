//! Error taxonomy surfaced at the HTTP boundary.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::activity_pub::DirectoryError;
use crate::activity_pub::model::PageError;

pub(crate) type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub(crate) enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("authentication required")]
    AuthRequired,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    /// A dependent Pod or remote call failed while a required write was in flight.
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub(crate) fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::AuthRequired => "AUTH_REQUIRED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Upstream(_) => "UPSTREAM_FAILURE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if let ApiError::Internal(error) = &self {
            error!(target: "http", error = format!("{error:#}"), "request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        let body = json!({ "error": self.code(), "message": message });
        (status, Json(body)).into_response()
    }
}

impl From<DirectoryError> for ApiError {
    fn from(value: DirectoryError) -> Self {
        match value {
            DirectoryError::InvalidUsername(_) => ApiError::Validation(value.to_string()),
            DirectoryError::UsernameTaken => ApiError::Conflict(value.to_string()),
            DirectoryError::Storage(error) => ApiError::Internal(error),
        }
    }
}

impl From<PageError> for ApiError {
    fn from(value: PageError) -> Self {
        ApiError::Validation(value.to_string())
    }
}
