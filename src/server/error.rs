//! Error-to-HTTP response conversion.
//!
//! Handlers return `Result<T, AppError>` and use `?` on anything producing a
//! [`galleryd_common::Error`].

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use galleryd_common::Error;
use serde_json::json;

/// Wrapper so we can implement `IntoResponse` for the shared error type.
#[derive(Debug)]
pub struct AppError(pub Error);

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(status = %status, error = %self.0, "Server error in API handler");
        }

        let body = axum::Json(json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
        }));

        if self.0.is_retryable() && status == StatusCode::SERVICE_UNAVAILABLE {
            return (status, [(header::RETRY_AFTER, "1")], body).into_response();
        }
        (status, body).into_response()
    }
}
