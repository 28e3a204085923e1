//! Circuit breaker states and derived health.

use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU8, Ordering};

/// Represents the possible states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Circuit is closed and operations are allowed.
    Closed = 0,

    /// Circuit is open and operations are rejected.
    Open = 1,

    /// Circuit is admitting a single trial call to test recovery.
    HalfOpen = 2,
}

impl State {
    /// Whether `self -> to` is one of the four permitted edges.
    pub fn can_transition_to(self, to: State) -> bool {
        matches!(
            (self, to),
            (State::Closed, State::Open)
                | (State::Open, State::HalfOpen)
                | (State::HalfOpen, State::Closed)
                | (State::HalfOpen, State::Open)
        )
    }

    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }

    /// Health of a single breaker in this state.
    pub fn health(self) -> HealthStatus {
        match self {
            State::Closed => HealthStatus::Healthy,
            State::HalfOpen => HealthStatus::Degraded,
            State::Open => HealthStatus::Unhealthy,
        }
    }
}

impl From<u8> for State {
    fn from(value: u8) -> Self {
        match value {
            1 => State::Open,
            2 => State::HalfOpen,
            _ => State::Closed,
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health classification for a breaker or a whole registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every protected backend is accepting traffic.
    Healthy,
    /// Some traffic is being short-circuited.
    Degraded,
    /// Nothing is getting through.
    Unhealthy,
}

impl HealthStatus {
    /// Status code served by the health endpoint.
    pub fn http_status(self) -> u16 {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => 200,
            HealthStatus::Unhealthy => 503,
        }
    }
}

/// Lock-free mirror of the breaker state for readers that must not contend
/// with the state machine lock.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> State {
        State::from(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }
}
