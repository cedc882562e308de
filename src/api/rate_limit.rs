//! Token-bucket admission rate limiting.
//!
//! Three buckets are consulted in order: global, per client IP, per
//! requested model. Tokens refill continuously at the configured rate and
//! the burst cap is `rate × burst_factor`. A rejection from any bucket ends
//! the request with 429 and a `Retry-After` hint from the bucket that
//! refused.
//!
//! Per-model limiting needs the request body, which axum middleware consumes
//! — so the body is read once here and restored for downstream stages.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::Instant,
};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use serde_json::Value;

use crate::api::request_id::TraceId;
use crate::config::RateLimitConfig;
use crate::error::{ErrorCode, RelayError};
use crate::proxy::{RelayState, MAX_BODY_BYTES};

/// Token bucket state. Fractional tokens avoid refill drift.
#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64) -> Self {
        Self { tokens: capacity, last_refill: Instant::now() }
    }

    /// Try to take one token at the given rate/capacity.
    /// Returns the seconds until a token is available on refusal.
    fn take(&mut self, rate: f64, capacity: f64) -> Result<(), f64> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let refilled = (self.tokens + elapsed * rate).min(capacity);

        if refilled < 1.0 {
            return Err(((1.0 - refilled) / rate).ceil());
        }
        self.tokens = refilled - 1.0;
        self.last_refill = now;
        Ok(())
    }
}

/// Shared limiter: one global bucket plus lazily-created keyed buckets.
pub struct RateLimiter {
    burst_factor: f64,
    global_rps: f64,
    per_ip_rps: f64,
    per_model_rps: std::collections::HashMap<String, f64>,
    global: Mutex<Bucket>,
    per_ip: DashMap<IpAddr, Bucket>,
    per_model: DashMap<String, Bucket>,
}

impl RateLimiter {
    /// Build from config; `None` when rate limiting is disabled.
    pub fn from_config(cfg: &RateLimitConfig) -> Option<Self> {
        if !cfg.enabled {
            return None;
        }
        let capacity = |rate: f64| (rate * cfg.burst_factor).max(1.0);
        Some(Self {
            burst_factor: cfg.burst_factor,
            global_rps: cfg.global_rps,
            per_ip_rps: cfg.per_ip_rps,
            per_model_rps: cfg.per_model_rps.clone(),
            global: Mutex::new(Bucket::full(capacity(cfg.global_rps))),
            per_ip: DashMap::new(),
            per_model: DashMap::new(),
        })
    }

    /// Whether the middleware needs to extract the model field at all.
    pub fn wants_model(&self) -> bool {
        !self.per_model_rps.is_empty()
    }

    fn capacity(&self, rate: f64) -> f64 {
        (rate * self.burst_factor).max(1.0)
    }

    /// Evaluate all applicable buckets in order.
    pub fn check(&self, ip: IpAddr, model: Option<&str>) -> Result<(), f64> {
        if self.global_rps > 0.0 {
            self.global
                .lock()
                .expect("rate limiter lock poisoned")
                .take(self.global_rps, self.capacity(self.global_rps))?;
        }

        if self.per_ip_rps > 0.0 {
            let capacity = self.capacity(self.per_ip_rps);
            self.per_ip
                .entry(ip)
                .or_insert_with(|| Bucket::full(capacity))
                .take(self.per_ip_rps, capacity)?;
        }

        if let Some(rate) = model.and_then(|m| self.per_model_rps.get(m)).copied() {
            if rate > 0.0 {
                let capacity = self.capacity(rate);
                self.per_model
                    .entry(model.unwrap_or_default().to_string())
                    .or_insert_with(|| Bucket::full(capacity))
                    .take(rate, capacity)?;
            }
        }

        Ok(())
    }
}

/// Client IP resolution: first `X-Forwarded-For` entry, then `X-Real-IP`,
/// then the TCP peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> IpAddr {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return ip;
            }
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if let Ok(ip) = real.trim().parse() {
            return ip;
        }
    }
    peer.map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
}

/// Axum middleware enforcing the configured buckets. No-op when rate
/// limiting is disabled.
pub async fn rate_limit_middleware(
    State(state): State<Arc<RelayState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(limiter) = state.rate_limiter.as_ref() else {
        return next.run(req).await;
    };

    let ip = client_ip(
        req.headers(),
        req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0),
    );
    let trace_id = req
        .extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_default();

    // Peek the model field for per-model buckets, restoring the body so the
    // pipeline still sees it.
    let (req, model) = if limiter.wants_model() && req.method() == Method::POST {
        let (parts, body) = req.into_parts();
        let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return RelayError::new(ErrorCode::BadRequest, "unreadable request body", trace_id)
                    .into_response()
            }
        };
        let model = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .and_then(|v| v.get("model").and_then(Value::as_str).map(String::from));
        (Request::from_parts(parts, Body::from(bytes)), model)
    } else {
        (req, None)
    };

    match limiter.check(ip, model.as_deref()) {
        Ok(()) => next.run(req).await,
        Err(retry_after) => {
            let mut response =
                RelayError::new(ErrorCode::RateLimited, "rate limit exceeded", trace_id)
                    .into_response();
            if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
            response
        }
    }
}
