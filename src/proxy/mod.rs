//! The per-request pipeline: admission has already happened in middleware by
//! the time [`handle`] runs; this module owns detection, resolution, the
//! attempt loop, and emission.
//!
//! The loop's contract: the client receives exactly one response, and once
//! the first body byte is on the wire no failover is attempted. Failover
//! decisions therefore all happen on (status, body) before anything is
//! emitted.

pub mod classify;
pub mod detect;
pub mod emit;
pub mod prepare;
pub mod upstream;

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    api::{rate_limit, rate_limit::RateLimiter, concurrency::ConcurrencyGate, request_id},
    config::{BackoffConfig, Config, Dialect},
    cooldown::CooldownManager,
    error::{ErrorCode, RelayError},
    resolver::{self, Candidate},
    traffic::{RequestRecord, TrafficLog},
};

/// Inbound bodies are buffered whole; anything larger than this is refused
/// during admission.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// How many recent request records the traffic ring buffer retains.
const TRAFFIC_CAPACITY: usize = 500;

/// Shared application state injected into every handler and middleware.
pub struct RelayState {
    /// Swappable live config; the lock is held only for `Arc::clone`.
    config_lock: RwLock<Arc<Config>>,
    /// Config file path, used by the hot-reload watcher.
    pub config_path: PathBuf,
    /// Per-(backend, model) cooldown map.
    pub cooldowns: Arc<CooldownManager>,
    /// Shared upstream HTTP clients + per-backend accounting.
    pub upstream: upstream::UpstreamClient,
    /// `None` when rate limiting is disabled. Built once at startup; a
    /// hot-reload does not rebuild the buckets (restart to change limits).
    pub rate_limiter: Option<RateLimiter>,
    /// `None` when the concurrency gate is disabled. Startup-only, like the
    /// rate limiter.
    pub concurrency: Option<ConcurrencyGate>,
    /// Recent request outcomes.
    pub traffic: Arc<TrafficLog>,
}

impl RelayState {
    pub fn new(config: Arc<Config>, config_path: PathBuf) -> anyhow::Result<Self> {
        let per_backend_limit = if config.concurrency.enabled {
            config.concurrency.per_backend_limit
        } else {
            0
        };
        let upstream =
            upstream::UpstreamClient::new(&config.timeout, config.backends.len(), per_backend_limit)?;
        let rate_limiter = RateLimiter::from_config(&config.rate_limit);
        let concurrency = ConcurrencyGate::from_config(&config.concurrency);

        Ok(Self {
            config_lock: RwLock::new(config),
            config_path,
            cooldowns: Arc::new(CooldownManager::new()),
            upstream,
            rate_limiter,
            concurrency,
            traffic: Arc::new(TrafficLog::new(TRAFFIC_CAPACITY)),
        })
    }

    /// Snapshot of the current live config. In-flight requests keep their
    /// snapshot across a reload.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Atomically replace the live config. Called only by the reload watcher.
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().expect("config lock poisoned") = new;
    }
}

/// Per-request accumulation for logging and the traffic record.
struct RequestContext {
    trace_id: String,
    alias: Option<String>,
    backend: Option<String>,
    model: Option<String>,
    attempts: usize,
    streamed: bool,
    error: Option<String>,
}

/// POST handler for all three proxy paths.
pub async fn handle(State(state): State<Arc<RelayState>>, req: Request) -> Response {
    let started = Instant::now();
    let trace_id = req
        .extensions()
        .get::<request_id::TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_else(request_id::generate);
    let peer = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0);

    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let inbound = detect::detect(&path, &parts.headers);
    let client_ip = rate_limit::client_ip(&parts.headers, peer);

    let mut ctx = RequestContext {
        trace_id: trace_id.clone(),
        alias: None,
        backend: None,
        model: None,
        attempts: 0,
        streamed: false,
        error: None,
    };

    let response = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(raw) => {
            run_pipeline(&state, &parts.headers, &path, inbound, client_ip, raw, &mut ctx).await
        }
        Err(_) => {
            ctx.error = Some("unreadable request body".into());
            RelayError::new(ErrorCode::BadRequest, "unreadable request body", trace_id.as_str())
                .into_response()
        }
    };

    let status = response.status();
    let latency_ms = started.elapsed().as_millis() as u64;
    info!(
        trace_id = %ctx.trace_id,
        alias = ctx.alias.as_deref().unwrap_or("-"),
        backend = ctx.backend.as_deref().unwrap_or("-"),
        model = ctx.model.as_deref().unwrap_or("-"),
        attempts = ctx.attempts,
        status = status.as_u16(),
        streamed = ctx.streamed,
        latency_ms,
        "request finished"
    );
    state.traffic.push(RequestRecord {
        trace_id: ctx.trace_id,
        timestamp: chrono::Utc::now(),
        alias: ctx.alias,
        backend: ctx.backend,
        model: ctx.model,
        attempts: ctx.attempts,
        status: status.as_u16(),
        streamed: ctx.streamed,
        latency_ms,
        error: ctx.error,
    });

    response
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    state: &Arc<RelayState>,
    inbound_headers: &axum::http::HeaderMap,
    path: &str,
    inbound: Dialect,
    client_ip: std::net::IpAddr,
    raw: Bytes,
    ctx: &mut RequestContext,
) -> Response {
    let trace_id = ctx.trace_id.clone();

    let parsed: Value = match serde_json::from_slice(&raw) {
        Ok(value) => value,
        Err(error) => {
            ctx.error = Some(format!("invalid JSON: {error}"));
            return RelayError::new(
                ErrorCode::InvalidJson,
                format!("request body is not valid JSON: {error}"),
                trace_id,
            )
            .into_response();
        }
    };

    let Some(alias) = parsed.get("model").and_then(Value::as_str).map(String::from) else {
        ctx.error = Some("missing model".into());
        return RelayError::new(
            ErrorCode::MissingModel,
            "request body has no `model` field",
            trace_id,
        )
        .into_response();
    };
    ctx.alias = Some(alias.clone());

    let stream_requested = parsed.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let config = state.config();

    let alias_known = config.model(&alias).is_some()
        || config.fallback.alias_fallback.contains_key(&alias);
    if !alias_known {
        ctx.error = Some("unknown model".into());
        return RelayError::new(
            ErrorCode::UnknownModel,
            format!("no model alias `{alias}` is configured"),
            trace_id,
        )
        .into_response();
    }

    let candidates = resolver::resolve(&config, &state.cooldowns, &alias);
    if candidates.is_empty() {
        ctx.error = Some("no eligible candidates".into());
        return RelayError::new(
            ErrorCode::NoBackend,
            format!("no backend is currently available for `{alias}`"),
            trace_id,
        )
        .into_response();
    }

    // Attempt bound: non-positive max_retries means "the whole ladder".
    let max_retries = config.fallback.max_retries;
    let limit = if max_retries <= 0 {
        candidates.len()
    } else {
        (max_retries as usize).min(candidates.len())
    };

    let cooldown = Duration::from_secs(config.fallback.cooldown_seconds);
    let mut last_upstream: Option<(StatusCode, axum::http::HeaderMap, Bytes, Dialect)> = None;

    for candidate in candidates.iter().take(limit) {
        if ctx.attempts > 0 && config.fallback.backoff.enabled {
            tokio::time::sleep(backoff_delay(&config.fallback.backoff, ctx.attempts)).await;
        }

        // Saturated backends are skipped outright — no cooldown, no queueing.
        let Some(_slot) = state.upstream.backend_slot(&candidate.backend) else {
            debug!(trace_id = %trace_id, backend = %candidate.backend, "backend at concurrency limit; skipping");
            ctx.error = Some(format!("backend {} at concurrency limit", candidate.backend));
            continue;
        };

        ctx.attempts += 1;
        ctx.backend = Some(candidate.backend.clone());
        ctx.model = Some(candidate.model.clone());

        let prepared = match prepare::prepare(&raw, &parsed, inbound, candidate) {
            Ok(prepared) => prepared,
            Err(error) => {
                // A conversion failure says nothing about backend health, so
                // the candidate fails without a cooldown.
                warn!(trace_id = %trace_id, backend = %candidate.backend, %error, "body preparation failed");
                ctx.error = Some(error.to_string());
                continue;
            }
        };
        debug!(
            trace_id = %trace_id,
            backend = %candidate.backend,
            model = %candidate.model,
            dialect = %candidate.dialect,
            converted = prepared.meta.converted,
            bytes = prepared.meta.prepared_bytes,
            original_bytes = prepared.meta.original_bytes,
            tools = prepared.meta.tool_count,
            max_tokens_source = prepared
                .meta
                .max_tokens_source
                .map(|s| s.as_str())
                .unwrap_or("-"),
            "attempting upstream"
        );

        let sent = state
            .upstream
            .send(candidate, path, inbound_headers, client_ip, prepared.bytes, stream_requested)
            .await;

        let upstream_response = match sent {
            Ok(response) => response,
            Err(error) => {
                warn!(trace_id = %trace_id, backend = %candidate.backend, %error, "transport failure");
                ctx.error = Some(error.to_string());
                penalize(state, candidate, cooldown, true);
                continue;
            }
        };

        let status = upstream_response.status();
        if status.is_success() {
            let is_event_stream = upstream_response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.starts_with("text/event-stream"));

            if stream_requested && is_event_stream {
                ctx.streamed = true;
                return emit::stream(upstream_response, inbound, candidate.dialect);
            }

            let headers = upstream_response.headers().clone();
            match upstream_response.bytes().await {
                Ok(body) => {
                    return emit::unary(status, &headers, body, inbound, candidate.dialect);
                }
                Err(error) => {
                    warn!(trace_id = %trace_id, backend = %candidate.backend, %error, "body read failed");
                    ctx.error = Some(error.to_string());
                    penalize(state, candidate, cooldown, true);
                    continue;
                }
            }
        }

        let headers = upstream_response.headers().clone();
        let body = upstream_response.bytes().await.unwrap_or_default();
        let body_text = String::from_utf8_lossy(&body);

        if classify::should_failover(&config.detection, status, &body_text) {
            debug!(
                trace_id = %trace_id,
                backend = %candidate.backend,
                status = status.as_u16(),
                "upstream error matched failover rules"
            );
            ctx.error = Some(format!("upstream {} returned {}", candidate.backend, status));
            penalize(state, candidate, cooldown, classify::is_retryable(status));
            last_upstream = Some((status, headers, body, candidate.dialect));
            continue;
        }

        // Non-2xx that the rules don't claim: the upstream's answer stands.
        return emit::unary(status, &headers, body, inbound, candidate.dialect);
    }

    // Ladder exhausted. Forward the last upstream reply when one exists;
    // a bare 502 is reserved for pure transport failure.
    if let Some((status, headers, body, dialect)) = last_upstream {
        return emit::unary(status, &headers, body, inbound, dialect);
    }

    RelayError::new(
        ErrorCode::NoBackend,
        format!(
            "all backends failed for `{alias}`: {}",
            ctx.error.as_deref().unwrap_or("no attempt possible")
        ),
        trace_id,
    )
    .into_response()
}

/// Record a cooldown for a failed candidate. Retryable failures always
/// refresh the deadline; others only start a cooldown that is not already
/// running.
fn penalize(state: &RelayState, candidate: &Candidate, duration: Duration, retryable: bool) {
    let key = candidate.cooldown_key();
    if retryable || !state.cooldowns.is_cooling_down(&key) {
        state.cooldowns.set_cooldown(&key, duration);
    }
}

/// Exponential backoff with optional ±25 % jitter.
fn backoff_delay(cfg: &BackoffConfig, attempt: usize) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let mut ms = cfg.initial_delay_ms as f64 * cfg.multiplier.max(1.0).powi(exponent);
    ms = ms.min(cfg.max_delay_ms as f64);
    if cfg.jitter {
        use rand::Rng;
        ms *= rand::rng().random_range(0.75..1.25);
    }
    Duration::from_millis(ms as u64)
}


#[cfg(test)]
mod tests {
    use super::test_support::{app, state_from_yaml};
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::{body_partial_json, header, method, path as on_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // Column-zero YAML so tests can append further top-level keys.
    fn two_backend_yaml(b1: &str, b2: &str) -> String {
        format!(
            r#"backends:
- name: b1
  url: {b1}
  api_key: key-1
- name: b2
  url: {b2}
  api_key: key-2
models:
  alias:
    routes:
    - backend: b1
      model: m1
      priority: 1
    - backend: b2
      model: m2
      priority: 2
"#
        )
    }

    fn chat_request(body: serde_json::Value) -> HttpRequest<Body> {
        HttpRequest::post("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn ok_completion() -> Value {
        json!({
            "id": "ok",
            "object": "chat.completion",
            "model": "m",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "hi" }, "finish_reason": "stop" }],
        })
    }

    // -----------------------------------------------------------------------
    // Failover scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn failover_on_500_reaches_second_backend_and_sets_cooldown() {
        let b1 = MockServer::start().await;
        let b2 = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&b1)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion()))
            .mount(&b2)
            .await;

        let state = state_from_yaml(&two_backend_yaml(&b1.uri(), &b2.uri()));
        let response = app(state.clone())
            .oneshot(chat_request(json!({
                "model": "alias",
                "messages": [{ "role": "user", "content": "hi" }],
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["id"], "ok");
        assert!(state.cooldowns.is_cooling_down("b1/m1"), "failing pair sidelined");
        assert!(!state.cooldowns.is_cooling_down("b2/m2"));
    }

    #[tokio::test]
    async fn failover_on_429_reaches_second_backend() {
        let b1 = MockServer::start().await;
        let b2 = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&b1)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion()))
            .mount(&b2)
            .await;

        let state = state_from_yaml(&two_backend_yaml(&b1.uri(), &b2.uri()));
        let response = app(state.clone())
            .oneshot(chat_request(json!({ "model": "alias", "messages": [] })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.cooldowns.is_cooling_down("b1/m1"));
    }

    #[tokio::test]
    async fn success_on_first_backend_never_contacts_second() {
        let b1 = MockServer::start().await;
        let b2 = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion()))
            .mount(&b1)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&b2)
            .await;

        let state = state_from_yaml(&two_backend_yaml(&b1.uri(), &b2.uri()));
        let response = app(state.clone())
            .oneshot(chat_request(json!({ "model": "alias", "messages": [] })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.cooldowns.is_empty(), "no cooldown on success");
        b2.verify().await;
    }

    #[tokio::test]
    async fn exhausted_ladder_forwards_last_upstream_response() {
        let b1 = MockServer::start().await;
        let b2 = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("b1 down"))
            .mount(&b1)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("b2 overloaded"))
            .mount(&b2)
            .await;

        let state = state_from_yaml(&two_backend_yaml(&b1.uri(), &b2.uri()));
        let response = app(state.clone())
            .oneshot(chat_request(json!({ "model": "alias", "messages": [] })))
            .await
            .unwrap();

        // The last upstream reply is forwarded, not replaced with a 502.
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"b2 overloaded");
        assert!(state.cooldowns.is_cooling_down("b1/m1"));
        assert!(state.cooldowns.is_cooling_down("b2/m2"));
    }

    #[tokio::test]
    async fn pure_transport_failure_yields_502_no_backend() {
        // Unroutable TEST-NET address: connection fails, no upstream reply.
        let yaml = r#"
            backends:
              - name: dead
                url: http://192.0.2.1:9
            models:
              alias:
                routes:
                  - backend: dead
                    model: m
            timeout:
              connect_timeout: 1
        "#;
        let state = state_from_yaml(yaml);
        let response = app(state.clone())
            .oneshot(chat_request(json!({ "model": "alias", "messages": [] })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["code"], "NO_BACKEND");
        assert!(body["trace_id"].as_str().unwrap().starts_with("req_"));
        assert!(state.cooldowns.is_cooling_down("dead/m"));
    }

    #[tokio::test]
    async fn unmatched_upstream_error_passes_through_without_cooldown() {
        let b1 = MockServer::start().await;
        let b2 = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such model"))
            .mount(&b1)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&b2)
            .await;

        let mut yaml = two_backend_yaml(&b1.uri(), &b2.uri());
        // Only 5xx triggers failover here; 404 must pass through.
        yaml.push_str("\ndetection:\n  error_codes: [\"5xx\"]\n");
        let state = state_from_yaml(&yaml);
        let response = app(state.clone())
            .oneshot(chat_request(json!({ "model": "alias", "messages": [] })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(state.cooldowns.is_empty());
        b2.verify().await;
    }

    #[tokio::test]
    async fn max_retries_bounds_the_ladder() {
        let b1 = MockServer::start().await;
        let b2 = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&b1)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&b2)
            .await;

        let mut yaml = two_backend_yaml(&b1.uri(), &b2.uri());
        yaml.push_str("\nfallback:\n  max_retries: 1\n");
        let state = state_from_yaml(&yaml);
        let response = app(state)
            .oneshot(chat_request(json!({ "model": "alias", "messages": [] })))
            .await
            .unwrap();

        // Only b1 was tried; its reply is forwarded.
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        b2.verify().await;
    }

    // -----------------------------------------------------------------------
    // Client-caused errors
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn invalid_json_is_400_without_upstream_contact() {
        let state = state_from_yaml("{}");
        let response = app(state)
            .oneshot(
                HttpRequest::post("/v1/chat/completions")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "INVALID_JSON");
    }

    #[tokio::test]
    async fn missing_model_is_400() {
        let state = state_from_yaml("{}");
        let response = app(state)
            .oneshot(chat_request(json!({ "messages": [] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "MISSING_MODEL");
    }

    #[tokio::test]
    async fn unknown_alias_is_404_unknown_model() {
        let state = state_from_yaml("{}");
        let response = app(state)
            .oneshot(chat_request(json!({ "model": "ghost", "messages": [] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "UNKNOWN_MODEL");
    }

    // -----------------------------------------------------------------------
    // Dialect conversion end to end
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn openai_request_to_anthropic_backend_converts_both_ways() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(on_path("/v1/messages"))
            .and(header("x-api-key", "ant-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_partial_json(json!({ "model": "claude-x", "system": "S" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "model": "claude-x",
                "content": [{ "type": "text", "text": "converted" }],
                "stop_reason": "end_turn",
                "usage": { "input_tokens": 3, "output_tokens": 4 },
            })))
            .mount(&upstream)
            .await;

        let yaml = format!(
            r#"
            backends:
              - name: ant
                url: {}
                api_key: ant-key
                protocol: anthropic
            models:
              alias:
                routes:
                  - backend: ant
                    model: claude-x
            "#,
            upstream.uri()
        );
        let state = state_from_yaml(&yaml);
        let response = app(state)
            .oneshot(chat_request(json!({
                "model": "alias",
                "messages": [
                    { "role": "system", "content": "S" },
                    { "role": "user", "content": "U" },
                ],
                "max_tokens": 64,
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "converted");
        assert_eq!(body["usage"]["total_tokens"], 7);
    }

    #[tokio::test]
    async fn anthropic_request_to_openai_backend_converts_both_ways() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(on_path("/v1/chat/completions"))
            .and(header("authorization", "Bearer oa-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": "hello" },
                    "finish_reason": "stop",
                }],
                "usage": { "prompt_tokens": 2, "completion_tokens": 3, "total_tokens": 5 },
            })))
            .mount(&upstream)
            .await;

        let yaml = format!(
            r#"
            backends:
              - name: oa
                url: {}
                api_key: oa-key
            models:
              alias:
                routes:
                  - backend: oa
                    model: gpt-4o
            "#,
            upstream.uri()
        );
        let state = state_from_yaml(&yaml);
        let response = app(state)
            .oneshot(
                HttpRequest::post("/v1/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "model": "alias",
                            "max_tokens": 32,
                            "messages": [{ "role": "user", "content": "hi" }],
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["type"], "message");
        assert_eq!(body["content"][0]["text"], "hello");
        assert_eq!(body["stop_reason"], "end_turn");
    }

    // -----------------------------------------------------------------------
    // Streaming end to end
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn anthropic_stream_is_reframed_as_openai_chunks() {
        let upstream = MockServer::start().await;
        let sse = "event: content_block_delta\n\
                   data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n\
                   event: message_stop\n\
                   data: {\"type\":\"message_stop\",\"stop_reason\":\"end_turn\"}\n\n";
        Mock::given(method("POST"))
            .and(on_path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"),
            )
            .mount(&upstream)
            .await;

        let yaml = format!(
            r#"
            backends:
              - name: ant
                url: {}
                api_key: k
                protocol: anthropic
            models:
              alias:
                routes:
                  - backend: ant
                    model: claude-x
            "#,
            upstream.uri()
        );
        let state = state_from_yaml(&yaml);
        let response = app(state)
            .oneshot(chat_request(json!({
                "model": "alias",
                "messages": [{ "role": "user", "content": "hi" }],
                "stream": true,
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();

        let frames: Vec<Value> = text
            .split("\n\n")
            .filter_map(|f| f.strip_prefix("data: "))
            .filter(|d| *d != "[DONE]")
            .map(|d| serde_json::from_str(d).unwrap())
            .collect();
        assert_eq!(frames[0]["choices"][0]["delta"]["content"], "Hi");
        assert_eq!(frames[0]["choices"][0]["finish_reason"], Value::Null);
        assert_eq!(frames[1]["choices"][0]["finish_reason"], "stop");
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn same_dialect_stream_passes_bytes_through() {
        let upstream = MockServer::start().await;
        let sse = "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"x\"}}]}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"),
            )
            .mount(&upstream)
            .await;

        let yaml = format!(
            r#"
            backends:
              - name: oa
                url: {}
            models:
              alias:
                routes:
                  - backend: oa
                    model: m
            "#,
            upstream.uri()
        );
        let state = state_from_yaml(&yaml);
        let response = app(state)
            .oneshot(chat_request(json!({ "model": "alias", "messages": [], "stream": true })))
            .await
            .unwrap();

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        assert_eq!(&bytes[..], sse.as_bytes());
    }

    // -----------------------------------------------------------------------
    // Cooldown interaction with routing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cooling_backend_is_bypassed_on_the_next_request() {
        let b1 = MockServer::start().await;
        let b2 = MockServer::start().await;
        // b1 may be contacted exactly once; after the 500 it must be skipped.
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .expect(1)
            .mount(&b1)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion()))
            .mount(&b2)
            .await;

        let state = state_from_yaml(&two_backend_yaml(&b1.uri(), &b2.uri()));
        for _ in 0..2 {
            let response = app(state.clone())
                .oneshot(chat_request(json!({ "model": "alias", "messages": [] })))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        b1.verify().await;
    }

    #[tokio::test]
    async fn alias_fallback_serves_when_primary_ladder_fails() {
        let b1 = MockServer::start().await;
        let b2 = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&b1)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion()))
            .mount(&b2)
            .await;

        let yaml = format!(
            r#"backends:
- name: b1
  url: {}
- name: b2
  url: {}
models:
  primary:
    routes:
    - backend: b1
      model: m1
  spare:
    routes:
    - backend: b2
      model: m2
fallback:
  alias_fallback:
    primary: [spare]
"#,
            b1.uri(),
            b2.uri()
        );
        let state = state_from_yaml(&yaml);
        let response = app(state)
            .oneshot(chat_request(json!({ "model": "primary", "messages": [] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn saturated_backend_is_skipped_without_cooldown() {
        let b1 = MockServer::start().await;
        let b2 = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&b1)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion()))
            .mount(&b2)
            .await;

        let mut yaml = two_backend_yaml(&b1.uri(), &b2.uri());
        yaml.push_str("concurrency:\n  enabled: true\n  per_backend_limit: 1\n");
        let state = state_from_yaml(&yaml);

        // Occupy b1's only slot for the duration of the request.
        let held = state.upstream.backend_slot("b1").expect("first slot");
        let response = app(state.clone())
            .oneshot(chat_request(json!({ "model": "alias", "messages": [] })))
            .await
            .unwrap();
        drop(held);

        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            !state.cooldowns.is_cooling_down("b1/m1"),
            "saturation is not a health signal"
        );
        b1.verify().await;
    }

    // -----------------------------------------------------------------------
    // Admission through the full stack
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn rate_limited_request_gets_429_with_retry_after() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion()))
            .mount(&upstream)
            .await;

        let mut yaml = two_backend_yaml(&upstream.uri(), &upstream.uri());
        yaml.push_str("rate_limit:\n  enabled: true\n  global_rps: 1\n  burst_factor: 1.0\n");
        let state = state_from_yaml(&yaml);

        let first = app(state.clone())
            .oneshot(chat_request(json!({ "model": "alias", "messages": [] })))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app(state)
            .oneshot(chat_request(json!({ "model": "alias", "messages": [] })))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key("retry-after"));
        assert_eq!(json_body(second).await["code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn full_concurrency_gate_returns_503() {
        let upstream = MockServer::start().await;
        let mut yaml = two_backend_yaml(&upstream.uri(), &upstream.uri());
        yaml.push_str(
            "concurrency:\n  enabled: true\n  max_requests: 1\n  max_queue_size: 0\n  queue_timeout: 1\n",
        );
        let state = state_from_yaml(&yaml);

        // Hold the only slot so the request finds the gate full.
        let _held = state
            .concurrency
            .as_ref()
            .expect("gate enabled")
            .acquire()
            .await
            .unwrap();

        let response = app(state.clone())
            .oneshot(chat_request(json!({ "model": "alias", "messages": [] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["code"], "CONCURRENCY_LIMIT");
    }

    #[tokio::test]
    async fn proxy_responses_carry_the_trace_id_header() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion()))
            .mount(&upstream)
            .await;

        let state = state_from_yaml(&two_backend_yaml(&upstream.uri(), &upstream.uri()));
        let response = app(state)
            .oneshot(chat_request(json!({ "model": "alias", "messages": [] })))
            .await
            .unwrap();

        let id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .expect("trace id echoed");
        assert!(id.starts_with("req_"));
        assert_eq!(id.len(), 22);
    }

    // -----------------------------------------------------------------------
    // Reverse streaming direction
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn openai_stream_is_reframed_as_anthropic_events() {
        let upstream = MockServer::start().await;
        let sse = "data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n\
                   data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n\
                   data: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(on_path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"),
            )
            .mount(&upstream)
            .await;

        let yaml = format!(
            r#"backends:
- name: oa
  url: {}
models:
  alias:
    routes:
    - backend: oa
      model: gpt-4o
"#,
            upstream.uri()
        );
        let state = state_from_yaml(&yaml);
        let response = app(state)
            .oneshot(
                HttpRequest::post("/v1/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "model": "alias",
                            "max_tokens": 16,
                            "stream": true,
                            "messages": [{ "role": "user", "content": "hi" }],
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();

        let names: Vec<&str> = text
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .filter_map(|f| f.lines().next())
            .filter_map(|l| l.strip_prefix("event: "))
            .collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "message_delta",
                "content_block_stop",
                "message_stop",
            ]
        );
        assert!(text.contains("\"model\":\"gpt-4o\""));
        assert!(text.contains("\"stop_reason\":\"end_turn\""));
    }

    // -----------------------------------------------------------------------
    // Backoff
    // -----------------------------------------------------------------------

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = BackoffConfig {
            enabled: true,
            initial_delay_ms: 100,
            max_delay_ms: 350,
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_millis(350), "capped");
    }

    #[test]
    fn backoff_jitter_stays_within_band() {
        let cfg = BackoffConfig {
            enabled: true,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 1.0,
            jitter: true,
        };
        for _ in 0..50 {
            let d = backoff_delay(&cfg, 1).as_millis() as f64;
            assert!((75.0..125.0).contains(&d), "jittered delay {d} out of band");
        }
    }
}
