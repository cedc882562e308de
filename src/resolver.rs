//! Alias resolution — turning a client-supplied model name into an ordered
//! list of upstream candidates.
//!
//! Resolution is recursive across alias-fallback edges and must terminate on
//! cycles: the visited set is passed by value on descent so sibling branches
//! do not blacklist each other, and re-entry into an alias already on the
//! current path yields an empty branch.
//!
//! Routes are sorted ascending by priority; runs of equal priority are
//! shuffled uniformly for load balancing. The RNG is seeded from wall time
//! per call — the goal is an even spread over many requests, not
//! unpredictability.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    config::{Config, Dialect, RouteConfig},
    cooldown::CooldownManager,
};

/// A resolved, currently-eligible (backend, upstream model) pair.
///
/// Transient — one instance per attempt; never outlives the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub backend: String,
    pub url: String,
    pub api_key: String,
    pub dialect: Dialect,
    pub model: String,
}

impl Candidate {
    /// The cooldown key this candidate is filtered and penalized under.
    pub fn cooldown_key(&self) -> String {
        CooldownManager::key(&self.backend, &self.model)
    }
}

/// Resolve `alias` into an ordered candidate list.
///
/// Candidates never include a disabled route, a disabled or missing backend,
/// or a pair currently under cooldown. An empty result means every ladder
/// rung (including fallback aliases) is unavailable right now.
pub fn resolve(config: &Config, cooldowns: &CooldownManager, alias: &str) -> Vec<Candidate> {
    resolve_inner(config, cooldowns, alias, HashSet::new())
}

fn resolve_inner(
    config: &Config,
    cooldowns: &CooldownManager,
    alias: &str,
    mut visited: HashSet<String>,
) -> Vec<Candidate> {
    if !visited.insert(alias.to_string()) {
        return Vec::new();
    }

    let mut candidates = Vec::new();

    if let Some(model) = config.model(alias).filter(|m| m.enabled) {
        let mut routes: Vec<&RouteConfig> = model.routes.iter().collect();
        routes.sort_by_key(|r| r.priority);
        shuffle_priority_runs(&mut routes);

        for route in routes {
            if !route.enabled {
                continue;
            }
            let Some(backend) = config.backend(&route.backend).filter(|b| b.enabled) else {
                continue;
            };
            if cooldowns.is_cooling_down(&CooldownManager::key(&backend.name, &route.model)) {
                continue;
            }
            candidates.push(Candidate {
                backend: backend.name.clone(),
                url: backend.url.clone(),
                api_key: backend.api_key.clone(),
                dialect: route.protocol.unwrap_or(backend.protocol),
                model: route.model.clone(),
            });
        }
    }

    if let Some(fallbacks) = config.fallback.alias_fallback.get(alias) {
        for next in fallbacks {
            // Copy-on-descent: each fallback branch sees the path so far but
            // not its siblings' visits.
            candidates.extend(resolve_inner(config, cooldowns, next, visited.clone()));
        }
    }

    candidates
}

/// Shuffle each run of equal-priority routes in place, preserving the
/// ordering between runs.
fn shuffle_priority_runs(routes: &mut [&RouteConfig]) {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let mut rng = StdRng::seed_from_u64(seed);

    let mut start = 0;
    while start < routes.len() {
        let priority = routes[start].priority;
        let mut end = start + 1;
        while end < routes.len() && routes[end].priority == priority {
            end += 1;
        }
        routes[start..end].shuffle(&mut rng);
        start = end;
    }
}
