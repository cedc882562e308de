//! Configuration types for llm-relay.
//!
//! Config is loaded from a YAML file at startup and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. A background watcher
//! re-reads the file when its mtime changes; a reload that fails to parse or
//! validate keeps the previous generation running.
//!
//! # Example
//! ```yaml
//! listen: ":8765"
//!
//! backends:
//!   - name: openai-main
//!     url: https://api.openai.com
//!     api_key: sk-...
//!     protocol: openai
//!   - name: anthropic-main
//!     url: https://api.anthropic.com
//!     api_key: sk-ant-...
//!     protocol: anthropic
//!
//! models:
//!   gpt-4o:
//!     routes:
//!       - backend: openai-main
//!         model: gpt-4o
//!         priority: 1
//!       - backend: anthropic-main
//!         model: claude-sonnet-4-5
//!         priority: 2
//!
//! fallback:
//!   cooldown_seconds: 60
//!   max_retries: 3
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Which API dialect a backend (or a single route) speaks.
///
/// llm-relay translates between the two dialects at the edge; routing code
/// only ever branches on this tag. It is deliberately a closed two-variant
/// enum rather than a trait — the protocol surface is fixed, not pluggable.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// OpenAI `/v1/chat/completions` protocol.
    /// Also spoken by vLLM, LM Studio, OpenRouter, and most gateways.
    #[default]
    #[serde(rename = "openai")]
    OpenAI,
    /// Anthropic Messages API (`/v1/messages`).
    Anthropic,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
        })
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Listen address. `":8765"` binds all interfaces on port 8765.
    #[serde(default = "defaults::listen")]
    pub listen: String,

    /// API key clients must present to the relay itself.
    ///
    /// Checked against `Authorization: Bearer …` for OpenAI-dialect requests
    /// and `x-api-key` for Anthropic-dialect requests. Unset disables client
    /// authentication.
    #[serde(default)]
    pub proxy_api_key: Option<String>,

    /// Named upstream providers.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Client-facing model aliases, each an ordered ladder of routes.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,

    /// Failover behaviour: cooldowns, retry bounds, alias fallback edges.
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// What counts as a failover-eligible upstream response.
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Upstream HTTP timeouts, in seconds.
    #[serde(default)]
    pub timeout: TimeoutConfig,

    /// Admission rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Admission concurrency caps.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Log sink configuration (consumed at startup only).
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content).context("parsing config YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        // Backend names must be unique and URLs must be http(s)
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            anyhow::ensure!(
                seen.insert(backend.name.as_str()),
                "duplicate backend name `{}`",
                backend.name
            );
            anyhow::ensure!(
                backend.url.starts_with("http://") || backend.url.starts_with("https://"),
                "backend `{}` URL must be http or https, got `{}`",
                backend.name,
                backend.url
            );
        }

        // Every route must reference a known backend
        for (alias, model) in &self.models {
            for route in &model.routes {
                anyhow::ensure!(
                    self.backend(&route.backend).is_some(),
                    "model `{}` route references unknown backend `{}`",
                    alias,
                    route.backend
                );
            }
        }

        // Alias-fallback targets are intentionally NOT validated against the
        // model table: resolution treats an unknown target as an empty
        // branch, and operators stage partial configs across reloads.

        anyhow::ensure!(
            self.rate_limit.burst_factor > 0.0,
            "rate_limit.burst_factor must be positive"
        );

        Ok(())
    }

    /// Look up a backend by name.
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Look up an alias in the model table.
    pub fn model(&self, alias: &str) -> Option<&ModelConfig> {
        self.models.get(alias)
    }

    /// Enabled alias names, sorted ascending — the `/v1/models` listing.
    pub fn enabled_aliases(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .models
            .iter()
            .filter(|(_, m)| m.enabled)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Socket address to bind. A bare `":port"` means all interfaces.
    pub fn listen_addr(&self) -> String {
        if let Some(port) = self.listen.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            self.listen.clone()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: defaults::listen(),
            proxy_api_key: None,
            backends: Vec::new(),
            models: HashMap::new(),
            fallback: FallbackConfig::default(),
            detection: DetectionConfig::default(),
            timeout: TimeoutConfig::default(),
            rate_limit: RateLimitConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// A named upstream provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend name, referenced by routes.
    pub name: String,

    /// Base URL, e.g. `https://api.openai.com`. Scheme must be http or https.
    pub url: String,

    /// Credential sent upstream. The header it travels in depends on
    /// [`BackendConfig::protocol`].
    #[serde(default)]
    pub api_key: String,

    /// Dialect this backend speaks.
    #[serde(default)]
    pub protocol: Dialect,

    /// Disabled backends are skipped during resolution.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
}

/// One client-facing model alias.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Disabled aliases resolve to nothing (fallback edges still apply).
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Ordered candidate ladder. Lower priority = tried first; routes sharing
    /// a priority are load-balanced by uniform shuffle.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// One (backend, upstream model) entry inside an alias.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Backend name (must exist in `backends`).
    pub backend: String,

    /// Model name sent to that backend.
    pub model: String,

    /// Lower = higher precedence.
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Per-route dialect override. Rarely needed — covers backends that
    /// expose both dialects on one host.
    #[serde(default)]
    pub protocol: Option<Dialect>,
}

/// Failover behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackConfig {
    /// How long a failing (backend, model) pair is sidelined, in seconds.
    #[serde(default = "defaults::cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Upper bound on upstream attempts per request.
    ///
    /// Zero or negative means "as many as there are candidates".
    #[serde(default = "defaults::max_retries")]
    pub max_retries: i32,

    /// Cross-alias fallback edges: when an alias is exhausted, each listed
    /// alias is resolved in turn and its candidates appended.
    #[serde(default)]
    pub alias_fallback: HashMap<String, Vec<String>>,

    /// Optional delay between consecutive attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: defaults::cooldown_seconds(),
            max_retries: defaults::max_retries(),
            alias_fallback: HashMap::new(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff between failover attempts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "defaults::initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "defaults::multiplier")]
    pub multiplier: f64,

    /// Randomize each delay within ±25 % to avoid retry synchronization.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: defaults::initial_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            multiplier: defaults::multiplier(),
            jitter: false,
        }
    }
}

/// Failover detection rules.
///
/// A response matching either list is abandoned and the next candidate tried;
/// anything else is returned to the client verbatim, success or not.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectionConfig {
    /// Status patterns: exact codes (`"429"`) or class wildcards (`"4xx"`,
    /// `"5xx"`). Defaults to both wildcard classes.
    #[serde(default = "defaults::error_codes")]
    pub error_codes: Vec<String>,

    /// Substrings matched against the upstream error body,
    /// e.g. `insufficient_quota`, `rate_limit`.
    #[serde(default)]
    pub error_patterns: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            error_codes: defaults::error_codes(),
            error_patterns: Vec::new(),
        }
    }
}

/// Upstream HTTP timeouts, in seconds.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// TCP connect timeout. Clamped to 1 s … 5 min at client build time.
    #[serde(default = "defaults::connect_timeout")]
    pub connect_timeout: u64,

    /// Read inactivity timeout for unary requests. Streams are exempt —
    /// idle gaps between tokens are expected.
    #[serde(default = "defaults::read_timeout")]
    pub read_timeout: u64,

    /// Budget for writing the request body upstream. The HTTP client has no
    /// standalone write deadline, so this is folded into the unary request
    /// deadline together with the connect and read budgets.
    #[serde(default = "defaults::write_timeout")]
    pub write_timeout: u64,

    /// End-to-end deadline for unary requests.
    #[serde(default = "defaults::total_timeout")]
    pub total_timeout: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: defaults::connect_timeout(),
            read_timeout: defaults::read_timeout(),
            write_timeout: defaults::write_timeout(),
            total_timeout: defaults::total_timeout(),
        }
    }
}

/// Admission rate limiting: three token buckets checked in order
/// (global, per client IP, per model).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Requests per second across all clients. Zero disables the bucket.
    #[serde(default)]
    pub global_rps: f64,

    /// Requests per second per client IP. Zero disables the bucket.
    #[serde(default)]
    pub per_ip_rps: f64,

    /// Requests per second per requested model alias.
    #[serde(default)]
    pub per_model_rps: HashMap<String, f64>,

    /// Burst capacity = rate × this factor.
    #[serde(default = "defaults::burst_factor")]
    pub burst_factor: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            global_rps: 0.0,
            per_ip_rps: 0.0,
            per_model_rps: HashMap::new(),
            burst_factor: defaults::burst_factor(),
        }
    }
}

/// Admission concurrency caps.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConcurrencyConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Global in-flight request ceiling.
    #[serde(default = "defaults::max_requests")]
    pub max_requests: usize,

    /// How many requests may wait for a global slot before being rejected.
    #[serde(default = "defaults::max_queue_size")]
    pub max_queue_size: usize,

    /// Seconds a queued request waits for a slot before 503.
    #[serde(default = "defaults::queue_timeout")]
    pub queue_timeout: u64,

    /// In-flight ceiling per backend, checked at attempt time. A saturated
    /// backend is skipped, not queued. Zero disables the check.
    #[serde(default)]
    pub per_backend_limit: i64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: defaults::max_requests(),
            max_queue_size: defaults::max_queue_size(),
            queue_timeout: defaults::queue_timeout(),
            per_backend_limit: 0,
        }
    }
}

/// Log sink configuration. Consumed once at startup by the tracing
/// subscriber; not hot-reloadable.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Level filter override (also controlled by `RUST_LOG`).
    #[serde(default)]
    pub level: Option<String>,

    /// `"json"` for machine-readable output; anything else is human format.
    #[serde(default)]
    pub format: Option<String>,
}

mod defaults {
    pub fn listen() -> String { ":8765".to_string() }
    pub fn enabled() -> bool { true }
    pub fn cooldown_seconds() -> u64 { 60 }
    pub fn max_retries() -> i32 { 3 }
    pub fn initial_delay_ms() -> u64 { 200 }
    pub fn max_delay_ms() -> u64 { 2_000 }
    pub fn multiplier() -> f64 { 2.0 }
    pub fn error_codes() -> Vec<String> { vec!["4xx".to_string(), "5xx".to_string()] }
    pub fn connect_timeout() -> u64 { 10 }
    pub fn read_timeout() -> u64 { 180 }
    pub fn write_timeout() -> u64 { 180 }
    pub fn total_timeout() -> u64 { 600 }
    pub fn burst_factor() -> f64 { 1.5 }
    pub fn max_requests() -> usize { 256 }
    pub fn max_queue_size() -> usize { 64 }
    pub fn queue_timeout() -> u64 { 5 }
}
