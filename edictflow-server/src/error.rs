//! Server error type and its HTTP rendering

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use edictflow_core::error::{ErrorCategory, ErrorDetail, ErrorResponse};
use edictflow_core::EdictError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Core(#[from] EdictError),

    #[error("missing or unknown bearer credential")]
    Unauthorized,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Core(e) => StatusCode::from_u16(e.http_status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServerError::Config(_) | ServerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            ServerError::Core(e) => e.to_error_response(),
            ServerError::Unauthorized => ErrorResponse {
                error: ErrorDetail {
                    code: "UNAUTHORIZED".to_string(),
                    message: self.to_string(),
                    category: ErrorCategory::PermissionDenied,
                    retryable: false,
                },
            },
            ServerError::Config(_) | ServerError::Io(_) => ErrorResponse {
                error: ErrorDetail {
                    code: "INTERNAL_ERROR".to_string(),
                    message: self.to_string(),
                    category: ErrorCategory::Internal,
                    retryable: false,
                },
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(self.to_error_response())).into_response()
    }
}
