//! In-memory log of recent request outcomes.
//!
//! [`TrafficLog`] is a fixed-capacity ring-buffer: once full, the oldest
//! record is evicted to make room for the newest. Bounded, O(1) memory
//! regardless of request volume; recording never blocks request handling.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Fixed-capacity ring-buffer of recent [`RequestRecord`]s.
///
/// Safe to share via `Arc<TrafficLog>`. [`push`][Self::push] uses a
/// non-blocking `try_lock`; under contention the record is silently dropped
/// rather than delaying the request path.
pub struct TrafficLog {
    capacity: usize,
    records: Mutex<VecDeque<RequestRecord>>,
}

impl TrafficLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a finished request. Best-effort and non-blocking.
    pub fn push(&self, record: RequestRecord) {
        if let Ok(mut records) = self.records.try_lock() {
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(record);
        }
    }
}

/// Outcome of one inbound request, including every upstream attempt it made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Trace id (`req_…`), also present in logs and error bodies.
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    /// Alias the client asked for.
    pub alias: Option<String>,
    /// Backend that produced the final response, if any attempt got that far.
    pub backend: Option<String>,
    /// Upstream model the winning backend was asked for.
    pub model: Option<String>,
    /// Number of upstream attempts made.
    pub attempts: usize,
    /// Final status returned to the client.
    pub status: u16,
    /// Whether the response was streamed.
    pub streamed: bool,
    pub latency_ms: u64,
    /// Description of the last failure when the request did not succeed.
    pub error: Option<String>,
}
