//! Core circuit breaker implementation.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{BreakerBuilder, BreakerConfig};
use crate::error::{BreakerError, BreakerResult, CircuitOpenError};
use crate::hook::HookRegistry;
use crate::metrics::{CallCounters, MetricSink};
use crate::policy::{BreakerPolicy, FailureCounts};
use crate::state::{HealthStatus, State, StateCell};

/// Mutable part of the state machine. Every check-then-mutate step happens
/// with this locked; the lock is never held across an `.await`.
struct Machine {
    state: State,
    failure_count: u32,
    consecutive_successes: u32,
    trial_in_flight: bool,
    next_attempt_at: Option<Instant>,
    last_state_change_at: Instant,
    last_state_change_ms: u64,
    // Bumped on every state change and reset. Outcomes of calls admitted
    // under an older generation never drive a transition.
    generation: u64,
}

impl Machine {
    fn counts(&self) -> FailureCounts {
        FailureCounts {
            failure_count: self.failure_count,
            consecutive_successes: self.consecutive_successes,
        }
    }
}

/// Ticket handed out by `admit`.
#[derive(Debug, Clone, Copy)]
enum Admission {
    Closed { generation: u64 },
    Trial { generation: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: State,
    to: State,
}

struct BreakerInner {
    name: String,
    config: BreakerConfig,
    policy: Arc<dyn BreakerPolicy>,
    machine: Mutex<Machine>,
    state: StateCell,
    counters: CallCounters,
    clock: Arc<dyn Clock>,
    metric_sink: Arc<dyn MetricSink>,
    hooks: Arc<HookRegistry>,
}

/// A named circuit breaker guarding one backend.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

/// Read-only view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: State,
    /// Failures counted toward the trip threshold.
    pub failure_count: u32,
    /// Successful trials while half-open.
    pub consecutive_successes: u32,
    /// Configured trip threshold.
    pub failure_threshold: u32,
    /// Configured close threshold.
    pub success_threshold: u32,
    /// Configured cool-down in milliseconds.
    pub open_duration_ms: u64,
    /// When a trial call becomes possible (ms since epoch), while open.
    pub next_attempt_at: Option<u64>,
    /// Whether the half-open trial call is currently running.
    pub trial_in_flight: bool,
    /// Calls the breaker let through.
    pub total_calls: u64,
    /// Admitted calls that failed.
    pub total_failures: u64,
    /// Calls short-circuited without running.
    pub total_rejections: u64,
    /// Time of the last state change (ms since epoch).
    pub last_state_change_at: u64,
    /// Health derived from the state.
    pub health_status: HealthStatus,
}

impl CircuitBreaker {
    pub(crate) fn new(
        name: String,
        config: BreakerConfig,
        policy: Arc<dyn BreakerPolicy>,
        clock: Arc<dyn Clock>,
        metric_sink: Arc<dyn MetricSink>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let machine = Machine {
            state: State::Closed,
            failure_count: 0,
            consecutive_successes: 0,
            trial_in_flight: false,
            next_attempt_at: None,
            last_state_change_at: clock.now(),
            last_state_change_ms: clock.millis_since_epoch(),
            generation: 0,
        };

        let inner = BreakerInner {
            name,
            config,
            policy,
            machine: Mutex::new(machine),
            state: StateCell::new(State::Closed),
            counters: CallCounters::default(),
            clock,
            metric_sink,
            hooks,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a new builder for customizing a circuit breaker.
    pub fn builder(name: impl Into<String>) -> BreakerBuilder {
        BreakerBuilder::new(name)
    }

    /// The breaker's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The thresholds this breaker was built with.
    pub fn config(&self) -> &BreakerConfig {
        &self.inner.config
    }

    /// Gets the current state of the circuit breaker.
    ///
    /// An open circuit whose cool-down has elapsed still reads `Open` until
    /// the next call claims the trial slot.
    pub fn current_state(&self) -> State {
        self.inner.state.load()
    }

    /// Executes an async operation guarded by the breaker.
    ///
    /// While the circuit is open the operation is not invoked and
    /// [`BreakerError::Open`] is returned. One retried logical call counts as
    /// one outcome, however many attempts happened inside it.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit().map_err(BreakerError::Open)?;
        let mut guard = CallGuard {
            breaker: self,
            admission,
            armed: true,
        };

        let start = self.inner.clock.now();
        let result = operation().await;
        let duration = self.inner.clock.now().saturating_duration_since(start);

        let admission = guard.disarm();
        match &result {
            Ok(_) => self.on_success(admission, duration),
            Err(_) => self.on_failure(admission, duration),
        }

        result.map_err(BreakerError::Operation)
    }

    /// Decides whether a call may run, claiming the trial slot if this caller
    /// is the first one after the cool-down.
    fn admit(&self) -> Result<Admission, CircuitOpenError> {
        let now = self.inner.clock.now();

        let (decision, transition) = {
            let mut machine = self.inner.machine.lock();
            match machine.state {
                State::Closed => (
                    Ok(Admission::Closed {
                        generation: machine.generation,
                    }),
                    None,
                ),
                State::Open => {
                    let ready_at = machine.next_attempt_at.unwrap_or(now);
                    if now < ready_at {
                        (Err(ready_at - now), None)
                    } else {
                        let transition = self.transition(&mut machine, State::HalfOpen, now);
                        machine.trial_in_flight = true;
                        (
                            Ok(Admission::Trial {
                                generation: machine.generation,
                            }),
                            Some(transition),
                        )
                    }
                }
                State::HalfOpen => {
                    if machine.trial_in_flight {
                        // The trial's outcome is unknown; a failure would
                        // reopen for a full cool-down.
                        (Err(self.inner.config.open_duration()), None)
                    } else {
                        machine.trial_in_flight = true;
                        (
                            Ok(Admission::Trial {
                                generation: machine.generation,
                            }),
                            None,
                        )
                    }
                }
            }
        };

        if let Some(transition) = transition {
            self.announce(transition);
        }

        match decision {
            Ok(admission) => {
                if let Admission::Trial { .. } = admission {
                    debug!(breaker = %self.inner.name, "admitting trial call");
                }
                Ok(admission)
            }
            Err(retry_after) => {
                self.inner.counters.record_rejection();
                self.inner.metric_sink.record_rejection(&self.inner.name);
                self.inner.hooks.execute_rejected_hook(&self.inner.name);
                debug!(
                    breaker = %self.inner.name,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "call short-circuited"
                );
                Err(CircuitOpenError {
                    name: self.inner.name.clone(),
                    retry_after,
                })
            }
        }
    }

    fn on_success(&self, admission: Admission, duration: Duration) {
        self.inner.counters.record_success();
        self.inner
            .metric_sink
            .record_call(&self.inner.name, true, duration);

        let transition = {
            let mut machine = self.inner.machine.lock();
            match admission {
                Admission::Closed { generation }
                    if machine.generation == generation && machine.state == State::Closed =>
                {
                    machine.failure_count = 0;
                    None
                }
                Admission::Trial { generation }
                    if machine.generation == generation && machine.state == State::HalfOpen =>
                {
                    machine.failure_count = 0;
                    machine.consecutive_successes += 1;
                    machine.trial_in_flight = false;
                    if self.inner.policy.should_close(&machine.counts()) {
                        let now = self.inner.clock.now();
                        Some(self.transition(&mut machine, State::Closed, now))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    fn on_failure(&self, admission: Admission, duration: Duration) {
        self.inner.counters.record_failure();
        self.inner
            .metric_sink
            .record_call(&self.inner.name, false, duration);
        self.inner.hooks.execute_failure_hook(&self.inner.name);

        let (transition, failures) = {
            let mut machine = self.inner.machine.lock();
            let now = self.inner.clock.now();
            let transition = match admission {
                Admission::Closed { generation }
                    if machine.generation == generation && machine.state == State::Closed =>
                {
                    machine.failure_count += 1;
                    if self.inner.policy.should_trip(&machine.counts()) {
                        Some(self.transition(&mut machine, State::Open, now))
                    } else {
                        None
                    }
                }
                Admission::Trial { generation }
                    if machine.generation == generation && machine.state == State::HalfOpen =>
                {
                    machine.failure_count += 1;
                    Some(self.transition(&mut machine, State::Open, now))
                }
                _ => None,
            };
            (transition, machine.failure_count)
        };

        if let Some(transition) = transition {
            if transition.from == State::Closed {
                warn!(
                    breaker = %self.inner.name,
                    failures,
                    open_ms = self.inner.config.open_duration_ms,
                    "failure threshold reached"
                );
            }
            self.announce(transition);
        }
    }

    /// Releases the trial slot of a call whose future was dropped before the
    /// operation finished.
    fn abandon_trial(&self, generation: u64) {
        let mut machine = self.inner.machine.lock();
        if machine.generation == generation
            && machine.state == State::HalfOpen
            && machine.trial_in_flight
        {
            machine.trial_in_flight = false;
            debug!(breaker = %self.inner.name, "trial call cancelled; slot released");
        }
    }

    /// Applies one edge of the state machine. Caller holds the lock.
    fn transition(&self, machine: &mut Machine, to: State, now: Instant) -> Transition {
        let from = machine.state;
        debug_assert!(from.can_transition_to(to), "illegal edge {from} -> {to}");

        machine.state = to;
        machine.generation += 1;
        machine.last_state_change_at = now;
        machine.last_state_change_ms = self.inner.clock.millis_since_epoch();
        machine.trial_in_flight = false;

        match to {
            State::Open => {
                machine.consecutive_successes = 0;
                machine.next_attempt_at = Some(now + self.inner.config.open_duration());
            }
            State::HalfOpen => {
                machine.consecutive_successes = 0;
            }
            State::Closed => {
                machine.failure_count = 0;
                machine.consecutive_successes = 0;
                machine.next_attempt_at = None;
            }
        }

        self.inner.state.store(to);
        Transition { from, to }
    }

    /// Reports a transition. Runs after the lock is released.
    fn announce(&self, transition: Transition) {
        let Transition { from, to } = transition;
        info!(breaker = %self.inner.name, %from, %to, "circuit breaker state changed");
        self.inner
            .metric_sink
            .record_state_transition(&self.inner.name, from, to);
        self.inner
            .hooks
            .execute_transition_hook(&self.inner.name, from, to);
    }

    /// Administrative override: back to `Closed` with every counter zeroed.
    ///
    /// Calls already running are not interrupted; their outcomes are counted
    /// but cannot move the state machine because they were admitted under an
    /// earlier generation.
    pub fn reset(&self) {
        let previous = {
            let mut machine = self.inner.machine.lock();
            let previous = machine.state;
            machine.state = State::Closed;
            machine.failure_count = 0;
            machine.consecutive_successes = 0;
            machine.trial_in_flight = false;
            machine.next_attempt_at = None;
            machine.generation += 1;
            if previous != State::Closed {
                machine.last_state_change_at = self.inner.clock.now();
                machine.last_state_change_ms = self.inner.clock.millis_since_epoch();
            }
            self.inner.state.store(State::Closed);
            self.inner.counters.reset();
            previous
        };

        info!(breaker = %self.inner.name, from = %previous, "circuit breaker reset");
    }

    /// Opens the circuit immediately, as if the failure threshold had been
    /// reached. Returns `false` if it was already open.
    pub fn force_open(&self) -> bool {
        let transition = {
            let mut machine = self.inner.machine.lock();
            if machine.state == State::Open {
                return false;
            }
            let now = self.inner.clock.now();
            self.transition(&mut machine, State::Open, now)
        };

        warn!(breaker = %self.inner.name, "circuit forced open");
        self.announce(transition);
        true
    }

    /// Returns a snapshot of the breaker without mutating it.
    pub fn get_stats(&self) -> StatsSnapshot {
        let machine = self.inner.machine.lock();
        let config = &self.inner.config;
        let next_attempt_at = match machine.state {
            State::Open => Some(machine.last_state_change_ms + config.open_duration_ms),
            State::Closed | State::HalfOpen => None,
        };

        StatsSnapshot {
            name: self.inner.name.clone(),
            state: machine.state,
            failure_count: machine.failure_count,
            consecutive_successes: machine.consecutive_successes,
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            open_duration_ms: config.open_duration_ms,
            next_attempt_at,
            trial_in_flight: machine.trial_in_flight,
            total_calls: self.inner.counters.total_calls(),
            total_failures: self.inner.counters.total_failures(),
            total_rejections: self.inner.counters.total_rejections(),
            last_state_change_at: machine.last_state_change_ms,
            health_status: machine.state.health(),
        }
    }

    /// Time spent in the current state.
    pub fn time_in_state(&self) -> Duration {
        let since = self.inner.machine.lock().last_state_change_at;
        self.inner.clock.now().saturating_duration_since(since)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

/// Gives the trial slot back if the calling future is dropped mid-operation.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    armed: bool,
}

impl CallGuard<'_> {
    fn disarm(&mut self) -> Admission {
        self.armed = false;
        self.admission
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Admission::Trial { generation } = self.admission {
            self.breaker.abandon_trial(generation);
        }
    }
}
