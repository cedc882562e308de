//! Trace-id middleware.
//!
//! Every inbound request gets a fresh `req_…` identifier — generated, never
//! client-supplied, so log correlation cannot be spoofed. The id is:
//!
//! - Stored as an axum [`Extension`](axum::Extension) for handlers
//! - Echoed back in the `X-Request-ID` response header
//! - Wrapped in a [`tracing`] span so every log line carries it
//! - Embedded in every structured error body as `trace_id`

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument as _;
use uuid::Uuid;

/// Newtype carrying the assigned trace id.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

/// `req_` + the first 18 characters of a dashless UUIDv4.
pub fn generate() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("req_{}", &uuid[..18])
}

/// Axum middleware assigning a [`TraceId`] to every request.
pub async fn trace_id_middleware(mut req: Request, next: Next) -> Response {
    let id = generate();
    req.extensions_mut().insert(TraceId(id.clone()));

    let span = tracing::debug_span!("request", trace_id = %id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(header_value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", header_value);
    }

    response
}
