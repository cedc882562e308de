//! Failover detection: deciding whether an upstream response is worth
//! abandoning for the next candidate.
//!
//! Matching is configuration-driven — exact status codes, `4xx`/`5xx` class
//! wildcards, and substring patterns over the error body. Anything that does
//! not match is passed through to the client verbatim, non-2xx included;
//! the relay only overrides an upstream's answer when told to.

use axum::http::StatusCode;

use crate::config::DetectionConfig;

/// True if this (status, body) should trigger failover to the next
/// candidate.
pub fn should_failover(rules: &DetectionConfig, status: StatusCode, body: &str) -> bool {
    if status.is_success() {
        return false;
    }

    let code = status.as_u16();
    if rules.error_codes.iter().any(|pattern| code_matches(pattern, code)) {
        return true;
    }

    rules.error_patterns.iter().any(|pattern| body.contains(pattern.as_str()))
}

/// Retryable failures refresh cooldowns aggressively; everything else only
/// sets a cooldown if the key is not already sidelined. A model rejecting a
/// malformed request will reject the retry too — extending its blackout on
/// every pass just starves the ladder.
pub fn is_retryable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

/// Match one status pattern: `"4xx"` / `"5xx"` wildcards or an exact code.
fn code_matches(pattern: &str, code: u16) -> bool {
    match pattern {
        "4xx" => (400..500).contains(&code),
        "5xx" => (500..600).contains(&code),
        exact => exact.parse::<u16>().is_ok_and(|p| p == code),
    }
}
