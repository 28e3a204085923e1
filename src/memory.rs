//! Resident memory sampling and load-shedding signal.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::metrics::{MetricSink, NullMetricSink};
use crate::settings::MemorySettings;

/// Reads the resident set size of the current process.
pub trait MemorySampler: Send + Sync + 'static {
    /// Resident bytes, or `None` when the platform offers no reading.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads `VmRSS` from `/proc/self/status`. Returns `None` off Linux.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcStatusSampler;

impl MemorySampler for ProcStatusSampler {
    fn resident_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

/// Extracts the `VmRSS:` line of a `/proc/<pid>/status` document, in bytes.
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    let multiplier = match fields.next() {
        Some("kB") | None => 1024,
        Some("mB") => 1024 * 1024,
        Some("B") => 1,
        Some(_) => return None,
    };
    value.checked_mul(multiplier)
}

/// One reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    /// Resident set size.
    pub rss_bytes: u64,
    /// Wall-clock time of the reading, in epoch milliseconds.
    pub taken_at_ms: u64,
}

/// Coarse classification of the last sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    /// Below the elevated threshold, or no reading yet.
    Normal,
    /// At or above the elevated threshold.
    Elevated,
    /// At or above the critical threshold.
    Critical,
}

struct MonitorState {
    last: Option<MemorySample>,
    pressure: MemoryPressure,
}

/// Samples resident memory and classifies it against configured thresholds.
pub struct MemoryMonitor {
    settings: MemorySettings,
    sampler: Box<dyn MemorySampler>,
    clock: Arc<dyn Clock>,
    metric_sink: Arc<dyn MetricSink>,
    state: Mutex<MonitorState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryMonitor {
    /// Creates a monitor reading `/proc/self/status`.
    pub fn new(settings: MemorySettings) -> Self {
        Self::with_sampler(
            settings,
            ProcStatusSampler,
            Arc::new(SystemClock),
            Arc::new(NullMetricSink),
        )
    }

    /// Creates a monitor with an explicit sampler, clock and sink.
    pub fn with_sampler<S: MemorySampler>(
        settings: MemorySettings,
        sampler: S,
        clock: Arc<dyn Clock>,
        metric_sink: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            settings,
            sampler: Box::new(sampler),
            clock,
            metric_sink,
            state: Mutex::new(MonitorState {
                last: None,
                pressure: MemoryPressure::Normal,
            }),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Starts sampling periodically on the current tokio runtime.
    ///
    /// Fails without spawning anything when the settings are invalid.
    pub fn spawn(self) -> Result<Arc<Self>, ConfigError> {
        self.settings.validate()?;
        let monitor = Arc::new(self);
        let period = monitor.settings.sample_interval();
        let shutdown = monitor.shutdown.clone();
        let weak = Arc::downgrade(&monitor);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = weak.upgrade() else {
                            break;
                        };
                        monitor.sample();
                    }
                }
            }
            debug!("memory monitor stopped");
        });
        *monitor.task.lock() = Some(handle);
        Ok(monitor)
    }

    /// Takes a reading now and updates the pressure level.
    pub fn sample(&self) -> Option<MemorySample> {
        let rss_bytes = self.sampler.resident_bytes()?;
        let sample = MemorySample {
            rss_bytes,
            taken_at_ms: self.clock.millis_since_epoch(),
        };
        let pressure = self.classify(rss_bytes);

        let previous = {
            let mut state = self.state.lock();
            state.last = Some(sample);
            std::mem::replace(&mut state.pressure, pressure)
        };

        self.metric_sink.record_memory_sample(rss_bytes);
        if pressure != previous {
            if pressure > previous {
                warn!(rss_bytes, ?previous, ?pressure, "memory pressure increased");
            } else {
                info!(rss_bytes, ?previous, ?pressure, "memory pressure eased");
            }
        }
        Some(sample)
    }

    /// Most recent reading.
    pub fn last_sample(&self) -> Option<MemorySample> {
        self.state.lock().last
    }

    /// Pressure level of the most recent reading.
    pub fn pressure(&self) -> MemoryPressure {
        self.state.lock().pressure
    }

    /// Whether callers should refuse new work.
    pub fn should_shed(&self) -> bool {
        self.pressure() == MemoryPressure::Critical
    }

    /// Stops periodic sampling.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "memory monitor did not stop cleanly");
            }
        }
    }

    fn classify(&self, rss_bytes: u64) -> MemoryPressure {
        if rss_bytes >= self.settings.critical_bytes {
            MemoryPressure::Critical
        } else if rss_bytes >= self.settings.elevated_bytes {
            MemoryPressure::Elevated
        } else {
            MemoryPressure::Normal
        }
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
