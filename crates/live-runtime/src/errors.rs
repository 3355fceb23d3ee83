//! Live runtime error types.
//!
//! Every handler failure is one of the caller-visible kinds below. Internal
//! details (store errors, storage errors, channel failures) are logged
//! server-side and replaced with a generic message on the wire.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Runtime error type.
///
/// Wire codes:
/// - `Unauthenticated`: `UNAUTHENTICATED`
/// - `Forbidden`: `FORBIDDEN`
/// - `NotFound`: `NOT_FOUND`
/// - `Conflict`: `CONFLICT`
/// - `Validation`: `VALIDATION`
/// - `Backend`, `Internal`: `BACKEND_ERROR` / `INTERNAL_ERROR`
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Missing or invalid identity token.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Session, participant, poll, question or upload does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Permission denial or ownership check failure.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// State conflict (ended session, double approval, closed poll).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Payload failed shape or length checks.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Session store or storage backend failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Actor channel failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Returns the stable wire code for this error.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Unauthenticated(_) => "UNAUTHENTICATED",
            RuntimeError::NotFound(_) => "NOT_FOUND",
            RuntimeError::Forbidden(_) => "FORBIDDEN",
            RuntimeError::Conflict(_) => "CONFLICT",
            RuntimeError::Validation(_) => "VALIDATION",
            RuntimeError::Backend(_) => "BACKEND_ERROR",
            RuntimeError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RuntimeError::Unauthenticated(_) => {
                "The access token is invalid or expired".to_string()
            }
            RuntimeError::NotFound(what) => format!("{what} not found"),
            RuntimeError::Forbidden(reason)
            | RuntimeError::Conflict(reason)
            | RuntimeError::Validation(reason) => reason.clone(),
            RuntimeError::Backend(_) => "A storage error occurred, please retry".to_string(),
            RuntimeError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// HTTP status for the request/response surface.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            RuntimeError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            RuntimeError::NotFound(_) => StatusCode::NOT_FOUND,
            RuntimeError::Forbidden(_) => StatusCode::FORBIDDEN,
            RuntimeError::Conflict(_) => StatusCode::CONFLICT,
            RuntimeError::Validation(_) => StatusCode::BAD_REQUEST,
            RuntimeError::Backend(_) => StatusCode::BAD_GATEWAY,
            RuntimeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for RuntimeError {
    fn into_response(self) -> Response {
        match &self {
            RuntimeError::Backend(detail) => {
                tracing::error!(target: "rt.errors", error = %detail, "Backend operation failed");
            }
            RuntimeError::Internal(detail) => {
                tracing::error!(target: "rt.errors", error = %detail, "Internal failure");
            }
            _ => {}
        }

        let status = self.status_code();
        let mut response = (
            status,
            Json(ErrorResponse {
                error: ErrorBody {
                    code: self.error_code(),
                    message: self.client_message(),
                },
            }),
        )
            .into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                "www-authenticate",
                axum::http::HeaderValue::from_static("Bearer realm=\"live-runtime\""),
            );
        }

        response
    }
}
