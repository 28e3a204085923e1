//! Configuration for circuit breakers.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::hook::HookRegistry;
use crate::metrics::{MetricSink, NullMetricSink};
use crate::policy::{BreakerPolicy, ThresholdPolicy};
use crate::registry::BreakerRegistry;

/// Thresholds and cool-down for one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Successful trial calls that close a half-open circuit.
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting a trial call.
    pub open_duration_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_duration_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    /// Cool-down as a `Duration`.
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }

    /// Rejects thresholds that would make the breaker trip or close on nothing.
    pub fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                format!("{field}.failure_threshold"),
                "must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid(
                format!("{field}.success_threshold"),
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Builder for creating circuit breakers with custom configurations.
pub struct BreakerBuilder {
    name: String,
    config: BreakerConfig,
    policy: Option<Arc<dyn BreakerPolicy>>,
    clock: Arc<dyn Clock>,
    metric_sink: Arc<dyn MetricSink>,
    hook_registry: Arc<HookRegistry>,
}

impl BreakerBuilder {
    /// Creates a new builder with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: BreakerConfig::default(),
            policy: None,
            clock: Arc::new(SystemClock),
            metric_sink: Arc::new(NullMetricSink),
            hook_registry: Arc::new(HookRegistry::new()),
        }
    }

    /// Replaces all thresholds at once.
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the number of consecutive failures required to open the circuit.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Sets the number of successful trials required to close the circuit.
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Sets how long the circuit stays open before a trial call.
    pub fn open_duration(mut self, duration: Duration) -> Self {
        self.config.open_duration_ms = duration.as_millis() as u64;
        self
    }

    /// Replaces the threshold policy with a custom one.
    pub fn policy<P: BreakerPolicy>(mut self, policy: P) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Sets the time source.
    pub fn clock<C: Clock>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sets a metric sink for the circuit breaker.
    pub fn metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Sets a hook registry for the circuit breaker.
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hook_registry = Arc::new(hooks);
        self
    }

    /// Builds a standalone circuit breaker.
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        self.config.validate(&self.name)?;

        let policy = self.policy.unwrap_or_else(|| {
            Arc::new(ThresholdPolicy::new(
                self.config.failure_threshold,
                self.config.success_threshold,
            ))
        });

        Ok(CircuitBreaker::new(
            self.name,
            self.config,
            policy,
            self.clock,
            self.metric_sink,
            self.hook_registry,
        ))
    }

    /// Builds the breaker and adds it to `registry` under its name.
    pub fn register(self, registry: &BreakerRegistry) -> Result<CircuitBreaker, ConfigError> {
        let breaker = self.build()?;
        registry.register(breaker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 1);
        assert_eq!(config.open_duration(), Duration::from_secs(30));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err = BreakerBuilder::new("chat")
            .failure_threshold(0)
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("chat.failure_threshold"));
    }

    #[test]
    fn builder_applies_settings() {
        let breaker = BreakerBuilder::new("media")
            .failure_threshold(2)
            .success_threshold(3)
            .open_duration(Duration::from_millis(1500))
            .build()
            .unwrap();

        assert_eq!(breaker.name(), "media");
        assert_eq!(
            breaker.config(),
            &BreakerConfig {
                failure_threshold: 2,
                success_threshold: 3,
                open_duration_ms: 1500,
            }
        );
    }
}
