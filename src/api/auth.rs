//! Proxy API key authentication middleware.
//!
//! When `proxy_api_key` is configured, every proxied request must present it
//! in the header its dialect uses: `x-api-key` for Anthropic-dialect
//! requests, `Authorization: Bearer …` otherwise. The dialect is classified
//! up front (the detector is pure and cheap) so that Anthropic SDK users are
//! never asked to fake a bearer token.
//!
//! When no key is configured the middleware passes everything through.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::api::request_id::TraceId;
use crate::config::Dialect;
use crate::error::{ErrorCode, RelayError};
use crate::proxy::{detect::detect, RelayState};

/// Axum middleware enforcing the relay's own API key.
pub async fn auth_middleware(
    State(state): State<Arc<RelayState>>,
    req: Request,
    next: Next,
) -> Response {
    let config = state.config();
    let Some(expected) = config.proxy_api_key.as_deref().filter(|k| !k.is_empty()) else {
        return next.run(req).await;
    };

    let dialect = detect(req.uri().path(), req.headers());
    let provided = match dialect {
        Dialect::Anthropic => req
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok()),
        Dialect::OpenAI => req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer ")),
    };

    if provided == Some(expected) {
        return next.run(req).await;
    }

    let trace_id = req
        .extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_default();
    RelayError::new(ErrorCode::Unauthorized, "invalid or missing API key", trace_id)
        .into_response()
}
