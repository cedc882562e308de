//! Upstream HTTP client: URL joining, header shaping, credentials, and
//! per-backend in-flight accounting.
//!
//! Two shared pooled clients are built once at startup: one with the full
//! timeout set for unary calls, one without a request deadline for streams
//! (bodies arrive token by token and may idle for minutes). Timeout and
//! per-backend-limit changes therefore require a restart; everything else in
//! the config hot-reloads.

use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use dashmap::DashMap;

use crate::config::{Dialect, TimeoutConfig};
use crate::resolver::Candidate;

/// Anthropic API version pinned by the relay.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Headers that must never be forwarded through a proxy hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct UpstreamClient {
    /// Unary requests — carries the configured total deadline.
    unary: reqwest::Client,
    /// Streaming requests — connect timeout only.
    streaming: reqwest::Client,
    total_timeout: Duration,
    per_backend_limit: i64,
    in_flight: DashMap<String, Arc<AtomicI64>>,
}

impl UpstreamClient {
    /// Build the shared clients. `backend_count` sizes the connection pool.
    pub fn new(
        timeouts: &TimeoutConfig,
        backend_count: usize,
        per_backend_limit: i64,
    ) -> anyhow::Result<Self> {
        let connect = Duration::from_secs(timeouts.connect_timeout.clamp(1, 300));
        let pool_per_host = (backend_count.max(1) * 4).clamp(10, 50);

        // reqwest has no standalone write deadline; writing the request body
        // is only bounded by the whole-request timeout. Fold the per-phase
        // budgets (connect + write + read) into the unary deadline so a
        // configured write_timeout tightens it; total_timeout stays the
        // outer cap.
        let phase_budget = connect
            + Duration::from_secs(timeouts.write_timeout.max(1))
            + Duration::from_secs(timeouts.read_timeout.max(1));
        let total_timeout = Duration::from_secs(timeouts.total_timeout.max(1)).min(phase_budget);

        let unary = reqwest::Client::builder()
            .connect_timeout(connect)
            .read_timeout(Duration::from_secs(timeouts.read_timeout.max(1)))
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(pool_per_host)
            .build()?;

        let streaming = reqwest::Client::builder()
            .connect_timeout(connect)
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(pool_per_host)
            .build()?;

        Ok(Self {
            unary,
            streaming,
            total_timeout,
            per_backend_limit,
            in_flight: DashMap::new(),
        })
    }

    /// Try to take an in-flight slot for `backend`.
    ///
    /// `None` means the backend is saturated; the attempt loop skips the
    /// candidate without recording a cooldown. The returned guard releases
    /// the slot on drop, error paths included.
    pub fn backend_slot(&self, backend: &str) -> Option<BackendSlot> {
        let counter = self
            .in_flight
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone();

        let prev = counter.fetch_add(1, Ordering::SeqCst);
        if self.per_backend_limit > 0 && prev >= self.per_backend_limit {
            counter.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(BackendSlot { counter })
    }

    /// Current in-flight count for a backend (diagnostics only).
    pub fn in_flight(&self, backend: &str) -> i64 {
        self.in_flight
            .get(backend)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Issue the prepared request to `candidate` and await the response
    /// header.
    pub async fn send(
        &self,
        candidate: &Candidate,
        inbound_path: &str,
        inbound_headers: &HeaderMap,
        client_ip: IpAddr,
        body: Bytes,
        stream: bool,
    ) -> reqwest::Result<reqwest::Response> {
        let url = target_url(&candidate.url, inbound_path, candidate.dialect);
        let headers = shape_headers(inbound_headers, candidate, client_ip);

        let client = if stream { &self.streaming } else { &self.unary };
        let mut request = client.post(&url).headers(headers).body(body);
        if !stream {
            request = request.timeout(self.total_timeout);
        }
        request.send().await
    }
}

/// RAII slot on a backend's in-flight counter.
pub struct BackendSlot {
    counter: Arc<AtomicI64>,
}

impl Drop for BackendSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Join a backend base URL with the inbound path.
///
/// If the inbound path already begins with the base URL's path component the
/// base path is not prepended twice (`http://h/v1` + `/v1/chat/completions`
/// targets `/v1/chat/completions`, not `/v1/v1/…`). Anthropic candidates are
/// always pointed at `/v1/messages` regardless of the inbound path, and an
/// OpenAI candidate serving an Anthropic-path request gets the mirrored
/// `/v1/chat/completions`.
pub fn target_url(base: &str, inbound_path: &str, dialect: Dialect) -> String {
    let path = match dialect {
        Dialect::Anthropic => "/v1/messages",
        Dialect::OpenAI if inbound_path.starts_with("/v1/messages") => "/v1/chat/completions",
        Dialect::OpenAI => inbound_path,
    };
    let base = base.trim_end_matches('/');

    if let Some((origin, base_path)) = split_base(base) {
        if !base_path.is_empty() && path.starts_with(base_path) {
            return format!("{origin}{path}");
        }
    }
    format!("{base}{path}")
}

/// Split `http://host:port/some/path` into origin and path parts.
fn split_base(base: &str) -> Option<(&str, &str)> {
    let scheme_end = base.find("://")? + 3;
    match base[scheme_end..].find('/') {
        Some(i) => Some(base.split_at(scheme_end + i)),
        None => Some((base, "")),
    }
}

/// Copy inbound headers minus hop-by-hop and credentials, then apply the
/// candidate dialect's auth and version headers.
fn shape_headers(inbound: &HeaderMap, candidate: &Candidate, client_ip: IpAddr) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in inbound {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) {
            continue;
        }
        // Host and framing headers are recomputed by the client; credentials
        // are replaced below.
        if matches!(lower, "host" | "content-length" | "authorization" | "x-api-key") {
            continue;
        }
        if candidate.dialect == Dialect::Anthropic
            && matches!(lower, "openai-organization" | "openai-project")
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    match candidate.dialect {
        Dialect::Anthropic => {
            if let Ok(value) = HeaderValue::from_str(&candidate.api_key) {
                headers.insert(HeaderName::from_static("x-api-key"), value);
            }
            headers.insert(
                HeaderName::from_static("anthropic-version"),
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        Dialect::OpenAI => {
            if !candidate.api_key.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", candidate.api_key)) {
                    headers.insert(header::AUTHORIZATION, value);
                }
            }
        }
    }

    // Forwarding chain: append ourselves-as-seen-by-the-client.
    let ip = client_ip.to_string();
    let forwarded = match inbound.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {ip}"),
        _ => ip.clone(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&ip) {
        headers.insert(HeaderName::from_static("x-real-ip"), value);
    }

    headers
}
