//! File-based settings for a whole guard layer.
//!
//! ```toml
//! [streams]
//! sweep_interval_ms = 10000
//! idle_timeout_ms = 120000
//!
//! [[backends]]
//! name = "chat"
//! base_url = "http://127.0.0.1:11434"
//! breaker = { failure_threshold = 5, open_duration_ms = 30000 }
//! retry = { max_retries = 2 }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::config::BreakerConfig;
use crate::error::ConfigError;
use crate::retry::RetryOptions;

/// Top-level settings document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardSettings {
    /// Protected backends, one breaker each.
    pub backends: Vec<BackendSettings>,
    /// Stream registry settings.
    pub streams: StreamSettings,
    /// Memory monitor settings.
    pub memory: MemorySettings,
}

/// One protected HTTP backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSettings {
    /// Unique name, also used for the breaker.
    pub name: String,
    /// Base URL requests are resolved against.
    pub base_url: String,
    /// Breaker thresholds.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Retry schedule.
    #[serde(default)]
    pub retry: RetryOptions,
}

/// Idle-stream sweep settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamSettings {
    /// Period of the idle sweep.
    pub sweep_interval_ms: u64,
    /// Idle timeout applied when a caller does not pick one.
    pub idle_timeout_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 10_000,
            idle_timeout_ms: 120_000,
        }
    }
}

impl StreamSettings {
    /// Sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Default idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Rejects a zero sweep period.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "streams.sweep_interval_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Resident-memory thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemorySettings {
    /// Sampling period of the background monitor.
    pub sample_interval_ms: u64,
    /// Resident size at which pressure becomes elevated.
    pub elevated_bytes: u64,
    /// Resident size at which callers should shed load.
    pub critical_bytes: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: 15_000,
            elevated_bytes: 1 << 30,
            critical_bytes: 2 << 30,
        }
    }
}

impl MemorySettings {
    /// Sampling period.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Rejects a zero sampling period and inverted thresholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "memory.sample_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.elevated_bytes > self.critical_bytes {
            return Err(ConfigError::invalid(
                "memory.elevated_bytes",
                "cannot exceed critical_bytes",
            ));
        }
        Ok(())
    }
}

impl GuardSettings {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let settings: GuardSettings = toml::from_str(source)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (index, backend) in self.backends.iter().enumerate() {
            let field = format!("backends[{index}]");
            if backend.name.trim().is_empty() {
                return Err(ConfigError::invalid(format!("{field}.name"), "must not be empty"));
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(ConfigError::DuplicateBreaker(backend.name.clone()));
            }
            if !(backend.base_url.starts_with("http://") || backend.base_url.starts_with("https://"))
            {
                return Err(ConfigError::invalid(
                    format!("{field}.base_url"),
                    "must be an http:// or https:// URL",
                ));
            }
            backend.breaker.validate(&format!("{field}.breaker"))?;
            backend.retry.validate(&format!("{field}.retry"))?;
        }

        self.streams.validate()?;
        self.memory.validate()
    }
}
