//! Directory of named breakers and aggregated health.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::breaker::{CircuitBreaker, StatsSnapshot};
use crate::error::ConfigError;
use crate::state::{HealthStatus, State};

/// Owns every breaker of a process, keyed by name.
///
/// Create one per process (or per test) and hand it to whatever needs it;
/// breakers are added when they are built and live as long as the registry.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<BTreeMap<String, CircuitBreaker>>,
}

/// Per-state breakdown behind a [`HealthReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDetail {
    /// Registered breakers.
    pub total: usize,
    /// Breakers in `CLOSED`.
    pub closed: usize,
    /// Breakers in `OPEN`.
    pub open: usize,
    /// Breakers in `HALF_OPEN`.
    pub half_open: usize,
    /// Names of breakers that are not closed.
    pub tripped: Vec<String>,
    /// Human-readable summary.
    pub message: String,
}

/// Aggregated health across all registered breakers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Overall classification.
    pub status: HealthStatus,
    /// Breakdown by state.
    pub detail: HealthDetail,
}

/// Result of [`BreakerRegistry::reset_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetSummary {
    /// Number of breakers forced back to `CLOSED`.
    pub reset_count: usize,
}

impl BreakerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a breaker; names must be unique.
    pub fn register(&self, breaker: CircuitBreaker) -> Result<CircuitBreaker, ConfigError> {
        let mut breakers = self.breakers.write();
        if breakers.contains_key(breaker.name()) {
            return Err(ConfigError::DuplicateBreaker(breaker.name().to_string()));
        }
        breakers.insert(breaker.name().to_string(), breaker.clone());
        Ok(breaker)
    }

    /// Looks up a breaker by name.
    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.read().get(name).cloned()
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Whether no breaker has been registered.
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }

    // Clone the handles out so no breaker lock is taken under the map lock.
    fn handles(&self) -> Vec<CircuitBreaker> {
        self.breakers.read().values().cloned().collect()
    }

    /// Snapshot of every breaker, keyed by name.
    pub fn get_all_stats(&self) -> BTreeMap<String, StatsSnapshot> {
        self.handles()
            .into_iter()
            .map(|breaker| (breaker.name().to_string(), breaker.get_stats()))
            .collect()
    }

    /// `healthy` when every breaker is closed, `unhealthy` when every
    /// breaker is open, `degraded` otherwise.
    pub fn get_health_status(&self) -> HealthReport {
        let snapshots = self.get_all_stats();
        summarize(snapshots.values())
    }

    /// Forces every breaker to `CLOSED`. Safe while calls are in flight.
    pub fn reset_all(&self) -> ResetSummary {
        let handles = self.handles();
        for breaker in &handles {
            breaker.reset();
        }
        info!(reset_count = handles.len(), "all circuit breakers reset");
        ResetSummary {
            reset_count: handles.len(),
        }
    }
}

fn summarize<'a>(snapshots: impl Iterator<Item = &'a StatsSnapshot>) -> HealthReport {
    let mut detail = HealthDetail {
        total: 0,
        closed: 0,
        open: 0,
        half_open: 0,
        tripped: Vec::new(),
        message: String::new(),
    };

    for snapshot in snapshots {
        detail.total += 1;
        match snapshot.state {
            State::Closed => detail.closed += 1,
            State::Open => detail.open += 1,
            State::HalfOpen => detail.half_open += 1,
        }
        if snapshot.state != State::Closed {
            detail.tripped.push(snapshot.name.clone());
        }
    }

    let status = if detail.closed == detail.total {
        HealthStatus::Healthy
    } else if detail.open == detail.total {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    };

    detail.message = match status {
        HealthStatus::Healthy => format!("all {} backend(s) available", detail.total),
        HealthStatus::Degraded => format!(
            "{} of {} backend(s) short-circuited: {}",
            detail.tripped.len(),
            detail.total,
            detail.tripped.join(", ")
        ),
        HealthStatus::Unhealthy => format!("all {} backend(s) unavailable", detail.total),
    };

    HealthReport { status, detail }
}
