//! Global concurrency gate with a bounded wait queue.
//!
//! A semaphore caps in-flight requests; when it is full, up to
//! `max_queue_size` requests may wait for `queue_timeout` before being
//! rejected with 503. Anything beyond the queue bound is rejected
//! immediately — a queue that grows without limit just converts overload
//! into latency.
//!
//! The per-backend ceiling is deliberately NOT enforced here: it is checked
//! at attempt time by the upstream client, because which backend serves a
//! request is unknown until resolution picks a candidate.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::api::request_id::TraceId;
use crate::config::ConcurrencyConfig;
use crate::error::{ErrorCode, RelayError};
use crate::proxy::RelayState;

/// Why a request was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
    /// The wait queue is already at capacity.
    QueueFull,
    /// Waited `queue_timeout` without a slot opening.
    QueueTimeout,
}

pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
    max_queue: usize,
    queue_timeout: Duration,
}

impl ConcurrencyGate {
    /// Build from config; `None` when the gate is disabled.
    pub fn from_config(cfg: &ConcurrencyConfig) -> Option<Self> {
        if !cfg.enabled {
            return None;
        }
        Some(Self {
            semaphore: Arc::new(Semaphore::new(cfg.max_requests.max(1))),
            queued: AtomicUsize::new(0),
            max_queue: cfg.max_queue_size,
            queue_timeout: Duration::from_secs(cfg.queue_timeout.max(1)),
        })
    }

    /// Take a slot, waiting in the bounded queue if necessary. The permit
    /// releases the slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, GateRejection> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(permit);
        }

        // Slot unavailable — join the queue if there is room.
        if self.queued.fetch_add(1, Ordering::SeqCst) >= self.max_queue {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(GateRejection::QueueFull);
        }

        let result = tokio::time::timeout(
            self.queue_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await;
        self.queued.fetch_sub(1, Ordering::SeqCst);

        match result {
            // acquire_owned only errors when the semaphore is closed, which
            // never happens here.
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(GateRejection::QueueTimeout),
            Err(_) => Err(GateRejection::QueueTimeout),
        }
    }

    /// Number of requests currently waiting (diagnostics only).
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

/// Axum middleware holding a global slot for the duration of the request.
pub async fn concurrency_middleware(
    State(state): State<Arc<RelayState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(gate) = state.concurrency.as_ref() else {
        return next.run(req).await;
    };

    match gate.acquire().await {
        Ok(_permit) => next.run(req).await,
        Err(rejection) => {
            let trace_id = req
                .extensions()
                .get::<TraceId>()
                .map(|t| t.0.clone())
                .unwrap_or_default();
            let message = match rejection {
                GateRejection::QueueFull => {
                    format!("concurrency queue full ({} waiting)", gate.queued())
                }
                GateRejection::QueueTimeout => "timed out waiting for a request slot".to_string(),
            };
            RelayError::new(ErrorCode::ConcurrencyLimit, message, trace_id).into_response()
        }
    }
}
