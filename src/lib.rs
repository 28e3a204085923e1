//! # upstream-guard
//!
//! Resilience primitives for a proxy sitting in front of unreliable HTTP
//! backends: circuit breakers, retry with exponential backoff, and a
//! registry that reclaims streaming responses whose clients went quiet.
//!
//! ## Circuit breaker states
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are rejected immediately until the cool-down elapses.
//! - **Half-Open**: exactly one trial call is let through; its outcome
//!   decides whether the circuit closes again or re-opens.
//!
//! ## Basic usage
//!
//! ```rust
//! use std::time::Duration;
//! use upstream_guard::{BreakerError, BreakerRegistry, CircuitBreaker, UpstreamError};
//!
//! # tokio_test::block_on(async {
//! let registry = BreakerRegistry::new();
//! let breaker = CircuitBreaker::builder("chat")
//!     .failure_threshold(3)
//!     .open_duration(Duration::from_secs(30))
//!     .register(&registry)
//!     .unwrap();
//!
//! let result = breaker
//!     .call(|| async { Err::<String, _>(UpstreamError::from_status(502, "bad gateway")) })
//!     .await;
//!
//! match result {
//!     Ok(body) => println!("got {body}"),
//!     Err(BreakerError::Open(err)) => println!("short-circuited: {err}"),
//!     Err(BreakerError::Operation(err)) => println!("backend failed: {err}"),
//! }
//! assert_eq!(registry.get_health_status().detail.total, 1);
//! # });
//! ```
//!
//! ## Retries inside a breaker
//!
//! [`ProtectedBackend::call`] runs the retry loop inside a single breaker
//! call, so one logical request counts as one breaker outcome regardless of
//! how many attempts it took.
//!
//! ## Features
//!
//! - `prometheus` - [`PrometheusSink`] backed by `prometheus-client`
//! - `admin` - axum router exposing breaker health and reset
//! - `reqwest` - `From<reqwest::Error>` for [`UpstreamError`]

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(feature = "admin")]
#[cfg_attr(docsrs, doc(cfg(feature = "admin")))]
pub mod admin;
mod breaker;
mod clock;
mod config;
mod error;
mod hook;
mod layer;
mod memory;
mod metrics;
mod policy;
pub mod prelude;
mod registry;
mod retry;
mod settings;
mod state;
mod stream;

// Re-exports
pub use breaker::{CircuitBreaker, StatsSnapshot};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{BreakerBuilder, BreakerConfig};
pub use error::{
    BreakerError, BreakerResult, CircuitOpenError, ConfigError, NetworkErrorKind, UpstreamError,
};
pub use hook::HookRegistry;
pub use layer::{BackendError, ProtectedBackend, ResilienceLayer};
pub use memory::{
    parse_vm_rss, MemoryMonitor, MemoryPressure, MemorySample, MemorySampler, ProcStatusSampler,
};
#[cfg(feature = "prometheus")]
#[cfg_attr(docsrs, doc(cfg(feature = "prometheus")))]
pub use metrics::PrometheusSink;
pub use metrics::{MetricSink, NullMetricSink};
pub use policy::{BreakerPolicy, FailureCounts, ThresholdPolicy};
pub use registry::{BreakerRegistry, HealthDetail, HealthReport, ResetSummary};
pub use retry::{
    is_retryable_error, with_retry, GiveUpReason, RetryCondition, RetryError, RetryOptions,
    RetryPolicy, Retryable,
};
pub use settings::{BackendSettings, GuardSettings, MemorySettings, StreamSettings};
pub use state::{HealthStatus, State};
pub use stream::{
    ForwardOutcome, ResourceManager, StreamId, StreamStats, StreamTarget, StreamTransport,
    TransportKeyRef,
};
