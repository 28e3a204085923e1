//! Retry with exponential backoff and jitter.
//!
//! The policy is stateless: every call to [`with_retry`] keeps its own
//! attempt counter, so one [`RetryPolicy`] can be shared by any number of
//! concurrent callers. Operations are re-issued as-is; callers must make
//! sure re-sending a request to the backend is harmless.

use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ConfigError, UpstreamError};
use crate::metrics::{MetricSink, NullMetricSink};

/// Classifies whether an error is worth another attempt.
pub trait Retryable {
    /// Returns true when re-issuing the operation may succeed.
    fn is_retryable(&self) -> bool;
}

impl Retryable for UpstreamError {
    fn is_retryable(&self) -> bool {
        is_retryable_error(self)
    }
}

/// Default classifier: transport failures, 5xx and 429 are retryable, any
/// other status is not.
pub fn is_retryable_error(err: &UpstreamError) -> bool {
    match err {
        UpstreamError::TransientNetwork { .. } | UpstreamError::Server { .. } => true,
        UpstreamError::Client { .. } | UpstreamError::UnexpectedStatus { .. } => false,
    }
}

/// Backoff schedule for a retried call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryOptions {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Growth factor applied per attempt.
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Symmetric jitter as a fraction of the delay, in `[0, 1]`.
    pub jitter_ratio: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryOptions {
    /// Checks the schedule for values that would make backoff meaningless.
    pub fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                format!("{field}.backoff_multiplier"),
                "must be a finite number >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::invalid(
                format!("{field}.jitter_ratio"),
                "must be within [0, 1]",
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::invalid(
                format!("{field}.base_delay_ms"),
                "cannot exceed max_delay_ms",
            ));
        }
        Ok(())
    }

    /// Un-jittered delay before retry number `attempt + 1`:
    /// `min(max_delay, base_delay * multiplier^attempt)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        // 0 * inf is NaN, and NaN.min(max) would pick the cap.
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff delay with symmetric jitter, `delay * (1 ± jitter_ratio)`.
    pub fn jittered_delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.backoff_delay(attempt);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }

        let ratio = self.jitter_ratio.min(1.0);
        let factor = 1.0 + rng.gen_range(-ratio..=ratio);
        Duration::from_millis((delay.as_millis() as f64 * factor).max(0.0) as u64)
    }
}

/// Decides which errors are retried.
pub type RetryCondition<E> = Arc<dyn Fn(&E) -> bool + Send + Sync + 'static>;

/// A backoff schedule paired with an error classifier.
pub struct RetryPolicy<E> {
    options: RetryOptions,
    condition: RetryCondition<E>,
    metric_sink: Arc<dyn MetricSink>,
}

impl<E: Retryable + 'static> RetryPolicy<E> {
    /// Policy that retries whatever `E::is_retryable` accepts.
    pub fn new(options: RetryOptions) -> Self {
        Self::with_condition(options, |err: &E| err.is_retryable())
    }
}

impl<E> RetryPolicy<E> {
    /// Policy with a caller-supplied classifier.
    pub fn with_condition<F>(options: RetryOptions, condition: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            options,
            condition: Arc::new(condition),
            metric_sink: Arc::new(NullMetricSink),
        }
    }

    /// Reports scheduled retries to `sink`.
    pub fn metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// The backoff schedule.
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Whether `err` is eligible for another attempt.
    pub fn should_retry(&self, err: &E) -> bool {
        (self.condition)(err)
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            options: self.options.clone(),
            condition: Arc::clone(&self.condition),
            metric_sink: Arc::clone(&self.metric_sink),
        }
    }
}

impl<E> Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Why [`with_retry`] stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// All `max_retries` additional attempts were used.
    Exhausted,
    /// The classifier rejected the error.
    NotRetryable,
}

/// The last failure of a retried operation, annotated with the attempt count.
#[derive(Debug)]
pub struct RetryError<E> {
    attempts: u32,
    reason: GiveUpReason,
    source: E,
}

impl<E> RetryError<E> {
    /// Total invocations made, including the first.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Why retrying stopped.
    pub fn reason(&self) -> GiveUpReason {
        self.reason
    }

    /// The final error.
    pub fn error(&self) -> &E {
        &self.source
    }

    /// Unwraps the final error.
    pub fn into_inner(self) -> E {
        self.source
    }
}

impl<E: Display> Display for RetryError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} (gave up after {} attempt(s))", self.source, self.attempts)
    }
}

impl<E: Error + 'static> Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Runs `operation`, re-invoking it after a backoff delay while it fails
/// with a retryable error and the retry budget lasts.
pub async fn with_retry<F, Fut, T, E>(
    mut operation: F,
    policy: &RetryPolicy<E>,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_retries = policy.options.max_retries;
    let mut attempt: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !policy.should_retry(&err) {
            debug!(attempt, error = %err, "error is not retryable");
            return Err(RetryError {
                attempts: attempt + 1,
                reason: GiveUpReason::NotRetryable,
                source: err,
            });
        }

        if attempt >= max_retries {
            warn!(attempts = attempt + 1, error = %err, "retry budget exhausted");
            return Err(RetryError {
                attempts: attempt + 1,
                reason: GiveUpReason::Exhausted,
                source: err,
            });
        }

        let delay = policy
            .options
            .jittered_delay(attempt, &mut rand::thread_rng());
        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
        policy.metric_sink.record_retry(attempt + 1, delay);

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

impl<E: Display> RetryPolicy<E> {
    /// Method form of [`with_retry`].
    pub async fn run<F, Fut, T>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        with_retry(operation, self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_retries: u32) -> RetryOptions {
        RetryOptions {
            max_retries,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 1_000,
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let options = no_jitter(10);
        let delays: Vec<u64> = (0..6)
            .map(|a| options.backoff_delay(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(options.backoff_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn zero_base_delay_never_waits() {
        let options = RetryOptions {
            base_delay_ms: 0,
            jitter_ratio: 0.5,
            ..no_jitter(10)
        };
        let mut rng = rand::thread_rng();
        for attempt in [0, 1, 64, 2_000, u32::MAX] {
            assert_eq!(options.backoff_delay(attempt), Duration::ZERO);
            assert_eq!(options.jittered_delay(attempt, &mut rng), Duration::ZERO);
        }
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let options = RetryOptions {
            jitter_ratio: 0.2,
            ..no_jitter(3)
        };
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let ms = options.jittered_delay(0, &mut rng).as_millis();
            assert!((80..=120).contains(&ms), "delay {ms}ms out of range");
        }
    }

    #[test]
    fn validation_rejects_bad_schedules() {
        let bad_multiplier = RetryOptions {
            backoff_multiplier: 0.5,
            ..RetryOptions::default()
        };
        assert!(bad_multiplier.validate("retry").is_err());

        let bad_jitter = RetryOptions {
            jitter_ratio: 1.5,
            ..RetryOptions::default()
        };
        assert!(bad_jitter.validate("retry").is_err());
        assert!(RetryOptions::default().validate("retry").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_uses_whole_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::<UpstreamError>::new(no_jitter(3));

        let result: Result<(), _> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(UpstreamError::from_status(503, "overloaded")) }
            },
            &policy,
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts(), 4);
        assert_eq!(err.reason(), GiveUpReason::Exhausted);
        assert!(matches!(
            err.into_inner(),
            UpstreamError::Server { status: 503, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::<UpstreamError>::new(no_jitter(5));

        let result: Result<(), _> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(UpstreamError::from_status(404, "unknown model")) }
            },
            &policy,
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.reason(), GiveUpReason::NotRetryable);
    }

    #[test]
    fn only_transport_and_server_failures_are_retryable() {
        assert!(is_retryable_error(&UpstreamError::from_status(502, "bad gateway")));
        assert!(is_retryable_error(&UpstreamError::from_status(429, "slow down")));
        assert!(!is_retryable_error(&UpstreamError::from_status(400, "bad request")));
        assert!(!is_retryable_error(&UpstreamError::from_status(302, "moved")));
        assert!(!is_retryable_error(&UpstreamError::from_status(600, "nonsense")));
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_follow_the_schedule() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::<UpstreamError>::new(no_jitter(3));
        let started = tokio::time::Instant::now();

        let result = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(UpstreamError::network(NetworkErrorKind::Reset, "eof"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        // 100 + 200 + 400
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(700));
        assert!(elapsed < Duration::from_millis(710));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_condition_overrides_classifier() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::with_condition(no_jitter(2), |e: &UpstreamError| {
            e.status() == Some(404)
        });

        let result: Result<(), _> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(UpstreamError::from_status(404, "not yet")) }
            },
            &policy,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
