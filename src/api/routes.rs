//! HTTP surface assembly.
//!
//! The proxy paths run the full admission stack (auth → rate limit →
//! concurrency) before the pipeline; the utility endpoints are deliberately
//! outside it so health probes keep answering under load shedding.

use std::sync::Arc;

use axum::{
    extract::State,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::api::{auth, concurrency, rate_limit};
use crate::proxy::{self, RelayState};

/// Build the complete application router.
pub fn router(state: Arc<RelayState>) -> Router {
    let proxied = Router::new()
        .route("/v1/chat/completions", post(proxy::handle))
        .route("/v1/completions", post(proxy::handle))
        .route("/v1/messages", post(proxy::handle))
        // Layer order (outermost first at runtime): auth, rate limit,
        // concurrency — mirrored here innermost-first.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            concurrency::concurrency_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware));

    let utility = Router::new()
        .route("/v1/models", get(list_models))
        .route("/models", get(list_models))
        .route("/health", get(health))
        .route("/healthz", get(health));

    proxied.merge(utility).with_state(state)
}

/// `GET /v1/models` — enabled aliases in the OpenAI models shape, ascending
/// by id.
async fn list_models(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let config = state.config();
    let created = chrono::Utc::now().timestamp();
    let data: Vec<serde_json::Value> = config
        .enabled_aliases()
        .into_iter()
        .map(|alias| {
            json!({
                "id": alias,
                "object": "model",
                "created": created,
                "owned_by": "llm-relay",
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

/// `GET /health` — liveness plus a coarse config summary.
async fn health(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let config = state.config();
    Json(json!({
        "status": "healthy",
        "backends": config.backends.len(),
        "models": config.models.len(),
    }))
}
