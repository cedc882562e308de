use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod config;
mod convert;
mod cooldown;
mod error;
mod proxy;
mod resolver;
mod traffic;

pub use config::Config;
pub use error::RelayError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a container HEALTHCHECK, hit /health and exit.
    // Avoids needing curl/wget in the image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    let config_path = std::env::var("LLM_RELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/llm-relay/config.yaml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    init_tracing(&config);

    info!(
        listen = %config.listen,
        backends = config.backends.len(),
        models = config.models.len(),
        "llm-relay starting"
    );

    let addr: SocketAddr = config
        .listen_addr()
        .parse()
        .with_context(|| format!("invalid listen address `{}`", config.listen))?;

    let state = Arc::new(proxy::RelayState::new(Arc::new(config), config_path)?);

    // Background tasks: cooldown sweeping and config hot-reload, both
    // stopping on the shutdown signal.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(cooldown::reaper(
        Arc::clone(&state.cooldowns),
        shutdown_rx.clone(),
    ));
    tokio::spawn(config_watcher(Arc::clone(&state), shutdown_rx));

    let app = api::routes::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn(api::request_id::trace_id_middleware))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
        );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    tokio::select! {
        result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_filter = config
        .logging
        .level
        .clone()
        .unwrap_or_else(|| "llm_relay=info,tower_http=warn".into());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if config.logging.format.as_deref() == Some("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /health and exit 0 on 200, 1 otherwise.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("LLM_RELAY_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8765);

    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on
/// mtime change. A reload that fails to parse or validate keeps the running
/// generation.
async fn config_watcher(
    state: Arc<proxy::RelayState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let path = state.config_path.clone();

    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    let mut interval = tokio::time::interval(Duration::from_secs(5));
    // The first tick fires immediately; skip it so startup never reloads.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(&path) {
            Ok(new_config) => {
                state.replace_config(Arc::new(new_config));
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "config reload failed — keeping previous config");
            }
        }
    }
}
