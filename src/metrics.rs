//! Metric sinks and call counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::state::State;

/// Trait for metrics sinks that receive guard-layer events.
pub trait MetricSink: Send + Sync + 'static {
    /// Records a breaker state transition.
    fn record_state_transition(&self, breaker: &str, from: State, to: State);

    /// Records the outcome of an operation a breaker let through.
    fn record_call(&self, breaker: &str, success: bool, duration: Duration);

    /// Records a call rejected without running the operation.
    fn record_rejection(&self, breaker: &str);

    /// Records a scheduled retry.
    fn record_retry(&self, attempt: u32, delay: Duration);

    /// Records a stream entering the registry.
    fn record_stream_registered(&self);

    /// Records a stream leaving the registry; `forced` is set for idle sweeps.
    fn record_stream_closed(&self, forced: bool);

    /// Records a resident memory sample.
    fn record_memory_sample(&self, rss_bytes: u64);
}

/// A null metrics sink that discards all events.
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn record_state_transition(&self, _breaker: &str, _from: State, _to: State) {}
    fn record_call(&self, _breaker: &str, _success: bool, _duration: Duration) {}
    fn record_rejection(&self, _breaker: &str) {}
    fn record_retry(&self, _attempt: u32, _delay: Duration) {}
    fn record_stream_registered(&self) {}
    fn record_stream_closed(&self, _forced: bool) {}
    fn record_memory_sample(&self, _rss_bytes: u64) {}
}

/// Lifetime counters for a breaker. Never reset by the state machine, only
/// by an administrative reset.
#[derive(Debug, Default)]
pub(crate) struct CallCounters {
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl CallCounters {
    pub(crate) fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejection(&self) {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    pub(crate) fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.total_failures.store(0, Ordering::Relaxed);
        self.total_rejections.store(0, Ordering::Relaxed);
    }
}

#[cfg(feature = "prometheus")]
pub use self::prometheus_sink::PrometheusSink;

#[cfg(feature = "prometheus")]
mod prometheus_sink {
    use std::time::Duration;

    use prometheus_client::encoding::EncodeLabelSet;
    use prometheus_client::metrics::counter::Counter;
    use prometheus_client::metrics::family::Family;
    use prometheus_client::metrics::gauge::Gauge;
    use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
    use prometheus_client::registry::Registry;

    use super::MetricSink;
    use crate::state::State;

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct BreakerLabels {
        breaker: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct TransitionLabels {
        breaker: String,
        from: String,
        to: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct CallLabels {
        breaker: String,
        outcome: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct CloseLabels {
        reason: String,
    }

    /// [`MetricSink`] backed by `prometheus-client` metrics.
    pub struct PrometheusSink {
        transitions: Family<TransitionLabels, Counter>,
        breaker_state: Family<BreakerLabels, Gauge>,
        calls: Family<CallLabels, Counter>,
        call_duration: Histogram,
        rejections: Family<BreakerLabels, Counter>,
        retries: Counter,
        active_streams: Gauge,
        streams_closed: Family<CloseLabels, Counter>,
        resident_memory: Gauge,
    }

    impl PrometheusSink {
        /// Creates the metrics and registers them under `upstream_guard_*`.
        pub fn register(registry: &mut Registry) -> Self {
            let sink = Self {
                transitions: Family::default(),
                breaker_state: Family::default(),
                calls: Family::default(),
                call_duration: Histogram::new(exponential_buckets(0.005, 2.0, 14)),
                rejections: Family::default(),
                retries: Counter::default(),
                active_streams: Gauge::default(),
                streams_closed: Family::default(),
                resident_memory: Gauge::default(),
            };

            let registry = registry.sub_registry_with_prefix("upstream_guard");
            registry.register(
                "breaker_transitions",
                "Circuit breaker state transitions",
                sink.transitions.clone(),
            );
            registry.register(
                "breaker_state",
                "Current breaker state (0 closed, 1 open, 2 half-open)",
                sink.breaker_state.clone(),
            );
            registry.register("calls", "Calls admitted by a breaker", sink.calls.clone());
            registry.register(
                "call_duration_seconds",
                "Duration of admitted calls",
                sink.call_duration.clone(),
            );
            registry.register(
                "rejections",
                "Calls short-circuited by an open breaker",
                sink.rejections.clone(),
            );
            registry.register("retries", "Scheduled retries", sink.retries.clone());
            registry.register(
                "active_streams",
                "Streams currently tracked",
                sink.active_streams.clone(),
            );
            registry.register(
                "streams_closed",
                "Streams removed from the registry",
                sink.streams_closed.clone(),
            );
            registry.register(
                "resident_memory_bytes",
                "Last sampled resident set size",
                sink.resident_memory.clone(),
            );

            sink
        }
    }

    impl MetricSink for PrometheusSink {
        fn record_state_transition(&self, breaker: &str, from: State, to: State) {
            self.transitions
                .get_or_create(&TransitionLabels {
                    breaker: breaker.to_string(),
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                })
                .inc();
            self.breaker_state
                .get_or_create(&BreakerLabels {
                    breaker: breaker.to_string(),
                })
                .set(to as i64);
        }

        fn record_call(&self, breaker: &str, success: bool, duration: Duration) {
            let outcome = if success { "success" } else { "failure" };
            self.calls
                .get_or_create(&CallLabels {
                    breaker: breaker.to_string(),
                    outcome: outcome.to_string(),
                })
                .inc();
            self.call_duration.observe(duration.as_secs_f64());
        }

        fn record_rejection(&self, breaker: &str) {
            self.rejections
                .get_or_create(&BreakerLabels {
                    breaker: breaker.to_string(),
                })
                .inc();
        }

        fn record_retry(&self, _attempt: u32, _delay: Duration) {
            self.retries.inc();
        }

        fn record_stream_registered(&self) {
            self.active_streams.inc();
        }

        fn record_stream_closed(&self, forced: bool) {
            self.active_streams.dec();
            let reason = if forced { "idle" } else { "completed" };
            self.streams_closed
                .get_or_create(&CloseLabels {
                    reason: reason.to_string(),
                })
                .inc();
        }

        fn record_memory_sample(&self, rss_bytes: u64) {
            self.resident_memory
                .set(i64::try_from(rss_bytes).unwrap_or(i64::MAX));
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use prometheus_client::encoding::text::encode;

        #[test]
        fn exports_transitions_and_streams() {
            let mut registry = Registry::default();
            let sink = PrometheusSink::register(&mut registry);

            sink.record_state_transition("chat", State::Closed, State::Open);
            sink.record_stream_registered();
            sink.record_stream_closed(true);

            let mut out = String::new();
            encode(&mut out, &registry).unwrap();
            assert!(out.contains("upstream_guard_breaker_transitions_total"));
            assert!(out.contains("breaker=\"chat\""));
            assert!(out.contains("reason=\"idle\""));
        }
    }
}
