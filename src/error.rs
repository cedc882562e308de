//! Structured HTTP error type for the relay surface.
//!
//! Every error the relay originates (as opposed to errors passed through from
//! an upstream) is serialized as `{"code": "...", "message": "...",
//! "trace_id": "req_..."}` with a status derived from the code. Handlers
//! return `Result<Response, RelayError>` and propagate with `?`; the
//! [`IntoResponse`] impl takes care of the body shape.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Machine-readable error codes exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    MissingModel,
    InvalidJson,
    UnknownModel,
    NoBackend,
    RateLimited,
    ConcurrencyLimit,
}

impl ErrorCode {
    /// Wire constant, e.g. `"NO_BACKEND"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::MissingModel => "MISSING_MODEL",
            Self::InvalidJson => "INVALID_JSON",
            Self::UnknownModel => "UNKNOWN_MODEL",
            Self::NoBackend => "NO_BACKEND",
            Self::RateLimited => "RATE_LIMITED",
            Self::ConcurrencyLimit => "CONCURRENCY_LIMIT",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            Self::BadRequest | Self::MissingModel | Self::InvalidJson => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::UnknownModel => StatusCode::NOT_FOUND,
            Self::NoBackend => StatusCode::BAD_GATEWAY,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::ConcurrencyLimit => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error originated by the relay, carrying the trace id of the request
/// that produced it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RelayError {
    pub code: ErrorCode,
    pub message: String,
    pub trace_id: String,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            trace_id: trace_id.into(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (
            self.code.status(),
            Json(json!({
                "code": self.code.as_str(),
                "message": self.message,
                "trace_id": self.trace_id,
            })),
        )
            .into_response()
    }
}
