//! Inbound dialect classification.
//!
//! Pure and deterministic: the same (path, headers) pair always classifies
//! the same way, with signals checked in strictly decreasing priority. The
//! result drives which header the proxy API key is read from and how the
//! response is framed, so it runs before admission.

use axum::http::HeaderMap;

use crate::config::Dialect;

/// Classify an inbound request's dialect.
pub fn detect(path: &str, headers: &HeaderMap) -> Dialect {
    // 1. Path is the strongest signal.
    if path.starts_with("/v1/messages") {
        return Dialect::Anthropic;
    }
    if path == "/v1/chat/completions" || path == "/v1/completions" || path.starts_with("/v1/chat/")
    {
        return Dialect::OpenAI;
    }

    // 2. Anthropic SDKs always send their version header.
    if headers.contains_key("anthropic-version") {
        return Dialect::Anthropic;
    }

    // 3. x-api-key without an OpenAI-looking bearer token.
    if headers.contains_key("x-api-key") {
        let bearer_sk = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("Bearer sk-"));
        if !bearer_sk {
            return Dialect::Anthropic;
        }
    }

    // 4. Backward-compatible default.
    Dialect::OpenAI
}
