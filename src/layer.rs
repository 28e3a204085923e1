//! Wiring of breakers, retries, the stream registry and the memory monitor
//! for a set of HTTP backends.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tracing::{info, info_span, Instrument};

use crate::breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::error::{BreakerError, ConfigError, UpstreamError};
use crate::memory::{MemoryMonitor, ProcStatusSampler};
use crate::metrics::{MetricSink, NullMetricSink};
use crate::registry::BreakerRegistry;
use crate::retry::{with_retry, RetryError, RetryPolicy};
use crate::settings::{BackendSettings, GuardSettings};
use crate::stream::ResourceManager;

/// Failure of a guarded backend call.
pub type BackendError = BreakerError<RetryError<UpstreamError>>;

/// One backend behind a breaker, with retries inside the breaker.
#[derive(Debug, Clone)]
pub struct ProtectedBackend {
    name: String,
    base_url: String,
    breaker: CircuitBreaker,
    retry: RetryPolicy<UpstreamError>,
}

impl ProtectedBackend {
    /// Pairs a breaker with a retry policy.
    pub fn new(
        base_url: impl Into<String>,
        breaker: CircuitBreaker,
        retry: RetryPolicy<UpstreamError>,
    ) -> Self {
        Self {
            name: breaker.name().to_string(),
            base_url: base_url.into(),
            breaker,
            retry,
        }
    }

    fn from_settings(
        settings: &BackendSettings,
        registry: &BreakerRegistry,
        clock: &Arc<dyn Clock>,
        sink: &Arc<dyn MetricSink>,
    ) -> Result<Self, ConfigError> {
        let breaker = CircuitBreaker::builder(settings.name.clone())
            .config(settings.breaker.clone())
            .clock(Arc::clone(clock))
            .metric_sink(Arc::clone(sink))
            .register(registry)?;
        let retry = RetryPolicy::new(settings.retry.clone()).metric_sink(Arc::clone(sink));
        Ok(Self::new(settings.base_url.clone(), breaker, retry))
    }

    /// Backend name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker guarding this backend.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The retry policy used inside the breaker.
    pub fn retry_policy(&self) -> &RetryPolicy<UpstreamError> {
        &self.retry
    }

    /// Resolves `path` against the base URL.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Runs `operation` with retries, as a single call through the breaker.
    ///
    /// The breaker sees one outcome per invocation of this method, however
    /// many attempts the retry loop made.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let span = info_span!("upstream_call", backend = %self.name);
        let retry = &self.retry;
        self.breaker
            .call(|| with_retry(operation, retry))
            .instrument(span)
            .await
    }
}

/// Everything a proxy needs to guard its backends, built from one
/// [`GuardSettings`] document.
pub struct ResilienceLayer {
    registry: Arc<BreakerRegistry>,
    backends: BTreeMap<String, ProtectedBackend>,
    streams: Arc<ResourceManager>,
    memory: Arc<MemoryMonitor>,
}

impl ResilienceLayer {
    /// Builds the layer and starts its background tasks on the current tokio
    /// runtime.
    pub fn start(settings: &GuardSettings) -> Result<Self, ConfigError> {
        Self::start_with(settings, Arc::new(SystemClock), Arc::new(NullMetricSink))
    }

    /// Like [`start`](Self::start) with an explicit clock and metric sink.
    pub fn start_with(
        settings: &GuardSettings,
        clock: Arc<dyn Clock>,
        metric_sink: Arc<dyn MetricSink>,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;

        let registry = Arc::new(BreakerRegistry::new());
        let backends = settings
            .backends
            .iter()
            .map(|backend| {
                ProtectedBackend::from_settings(backend, &registry, &clock, &metric_sink)
                    .map(|protected| (backend.name.clone(), protected))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let streams = ResourceManager::spawn(
            settings.streams.clone(),
            Arc::clone(&clock),
            Arc::clone(&metric_sink),
        )?;
        let memory = MemoryMonitor::with_sampler(
            settings.memory.clone(),
            ProcStatusSampler,
            clock,
            metric_sink,
        )
        .spawn()?;

        info!(backends = backends.len(), "resilience layer started");
        Ok(Self {
            registry,
            backends,
            streams,
            memory,
        })
    }

    /// Looks up a backend by name.
    pub fn backend(&self, name: &str) -> Option<&ProtectedBackend> {
        self.backends.get(name)
    }

    /// All backends, ordered by name.
    pub fn backends(&self) -> impl Iterator<Item = &ProtectedBackend> {
        self.backends.values()
    }

    /// Breaker registry shared by every backend.
    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.registry
    }

    /// Stream registry.
    pub fn streams(&self) -> &Arc<ResourceManager> {
        &self.streams
    }

    /// Memory monitor.
    pub fn memory(&self) -> &Arc<MemoryMonitor> {
        &self.memory
    }

    /// Stops background tasks and closes any open streams.
    pub async fn shutdown(&self) {
        self.streams.shutdown().await;
        self.memory.shutdown().await;
        info!("resilience layer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::error::NetworkErrorKind;
    use crate::retry::{GiveUpReason, RetryOptions};
    use crate::state::State;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn backend(clock: &MockClock, max_retries: u32) -> ProtectedBackend {
        let breaker = CircuitBreaker::builder("chat")
            .failure_threshold(2)
            .open_duration(Duration::from_secs(1))
            .clock(clock.clone())
            .build()
            .unwrap();
        let retry = RetryPolicy::new(RetryOptions {
            max_retries,
            base_delay_ms: 10,
            jitter_ratio: 0.0,
            ..RetryOptions::default()
        });
        ProtectedBackend::new("http://127.0.0.1:11434/", breaker, retry)
    }

    #[test]
    fn url_joins_without_double_slash() {
        let clock = MockClock::new();
        let backend = backend(&clock, 0);
        assert_eq!(backend.url("/api/generate"), "http://127.0.0.1:11434/api/generate");
        assert_eq!(backend.url("api/tags"), "http://127.0.0.1:11434/api/tags");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_count_as_one_breaker_failure() {
        let clock = MockClock::new();
        let backend = backend(&clock, 3);
        let attempts = AtomicU32::new(0);

        let err = backend
            .call(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(UpstreamError::network(NetworkErrorKind::Refused, "refused"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(err.response_status(), 503);
        match err {
            BreakerError::Operation(retry) => assert_eq!(retry.reason(), GiveUpReason::Exhausted),
            other => panic!("unexpected {other:?}"),
        }
        let stats = backend.breaker().get_stats();
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.state, State::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_pass_through() {
        let clock = MockClock::new();
        let backend = backend(&clock, 3);

        let err = backend
            .call(|| async { Err::<(), _>(UpstreamError::from_status(404, "no such model")) })
            .await
            .unwrap_err();
        assert_eq!(err.response_status(), 404);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_skips_retries() {
        let clock = MockClock::new();
        let backend = backend(&clock, 1);
        for _ in 0..2 {
            let _ = backend
                .call(|| async { Err::<(), _>(UpstreamError::from_status(500, "down")) })
                .await;
        }
        assert_eq!(backend.breaker().current_state(), State::Open);

        let attempts = AtomicU32::new(0);
        let err = backend
            .call(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, UpstreamError>(()) }
            })
            .await
            .unwrap_err();
        assert!(err.is_open());
        assert_eq!(err.response_status(), 503);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn layer_builds_backends_from_settings() {
        let settings = GuardSettings::from_toml_str(
            r#"
            [[backends]]
            name = "chat"
            base_url = "http://127.0.0.1:11434"

            [[backends]]
            name = "media"
            base_url = "http://127.0.0.1:7860"
            breaker = { failure_threshold = 1 }
            "#,
        )
        .unwrap();

        let layer = ResilienceLayer::start(&settings).unwrap();
        assert_eq!(layer.registry().len(), 2);
        assert_eq!(
            layer.backends().map(|b| b.name()).collect::<Vec<_>>(),
            vec!["chat", "media"]
        );
        assert_eq!(
            layer.backend("media").unwrap().breaker().config().failure_threshold,
            1
        );
        assert!(layer.backend("embed").is_none());

        layer.shutdown().await;
    }
}
