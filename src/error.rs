//! Error kinds and their HTTP/WebSocket mapping.
//!
//! Mirrors the `AuthError` / `ErrorResponse` split the teacher crate uses
//! for its capability errors: a `thiserror` enum carries the machine-
//! actionable kind, and a small serializable shape is what clients
//! actually see.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// The five error kinds from SPEC_FULL.md §7.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("upstream temporarily unavailable: {0}")]
    UpstreamTransient(String),

    #[error("upstream permanently failed: {0}")]
    UpstreamPermanent(String),

    #[error("sandbox is terminal: {0}")]
    TerminalLifecycle(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoordinatorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "INVALID_MESSAGE",
            Self::Auth(_) => "UNAUTHORIZED",
            Self::UpstreamTransient(_) => "UPSTREAM_TRANSIENT",
            Self::UpstreamPermanent(_) => "UPSTREAM_PERMANENT",
            Self::TerminalLifecycle(_) => "TERMINAL_LIFECYCLE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::UpstreamTransient(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamPermanent(_) => StatusCode::BAD_GATEWAY,
            Self::TerminalLifecycle(_) => StatusCode::GONE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl From<&CoordinatorError> for ErrorBody {
    fn from(err: &CoordinatorError) -> Self {
        Self {
            error: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let body = ErrorBody::from(&self);
        (self.status(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            CoordinatorError::Validation("x".into()).code(),
            "INVALID_MESSAGE"
        );
        assert_eq!(
            CoordinatorError::TerminalLifecycle("x".into()).code(),
            "TERMINAL_LIFECYCLE"
        );
        assert_eq!(
            CoordinatorError::TerminalLifecycle("x".into()).status(),
            StatusCode::GONE
        );
    }
}
