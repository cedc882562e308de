//! Per-(backend, model) cooldown tracking.
//!
//! After a failover-eligible failure the offending (backend, upstream model)
//! pair is sidelined for a fixed duration. Granularity is deliberately
//! per-key rather than per-backend: one failing model must not take down its
//! siblings on the same host.
//!
//! Expiry is an absolute deadline; reads compare against "now" so lookups are
//! always correct even between sweeps. The background reaper only bounds
//! memory — it removes entries whose deadline has passed, including entries
//! created under an earlier config generation.

use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

use tracing::debug;

/// Thread-safe cooldown map. Read-heavy (every resolution consults it),
/// write-occasional (only on failures), so a read-write lock fits.
#[derive(Default)]
pub struct CooldownManager {
    entries: RwLock<HashMap<String, Instant>>,
}

impl CooldownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical key composition.
    pub fn key(backend: &str, model: &str) -> String {
        format!("{backend}/{model}")
    }

    /// True iff the key exists and its deadline is still in the future.
    pub fn is_cooling_down(&self, key: &str) -> bool {
        let entries = self.entries.read().expect("cooldown lock poisoned");
        entries.get(key).is_some_and(|expiry| *expiry > Instant::now())
    }

    /// Start (or refresh) a cooldown. Overwrite semantics: repeated failures
    /// push the deadline out, they do not accumulate.
    pub fn set_cooldown(&self, key: &str, duration: Duration) {
        let expiry = Instant::now() + duration;
        let mut entries = self.entries.write().expect("cooldown lock poisoned");
        entries.insert(key.to_string(), expiry);
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn clear_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().expect("cooldown lock poisoned");
        let before = entries.len();
        entries.retain(|_, expiry| *expiry > now);
        before - entries.len()
    }

    /// Number of live entries (expired-but-unswept included).
    pub fn len(&self) -> usize {
        self.entries.read().expect("cooldown lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background sweep loop. Runs until the shutdown channel fires; the interval
/// is coarse because correctness never depends on sweeping.
pub async fn reaper(
    manager: std::sync::Arc<CooldownManager>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    // The first tick fires immediately; there is nothing to sweep yet.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let removed = manager.clear_expired();
                if removed > 0 {
                    debug!(removed, remaining = manager.len(), "swept expired cooldowns");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
