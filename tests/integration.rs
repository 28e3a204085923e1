use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use upstream_guard::{
    with_retry, BreakerError, BreakerRegistry, CircuitBreaker, Clock, HealthStatus, HookRegistry,
    MockClock, NullMetricSink, ProtectedBackend, ResetSummary, ResourceManager, RetryOptions,
    RetryPolicy, State, StreamSettings, StreamTransport, SystemClock, UpstreamError,
};

fn server_error() -> UpstreamError {
    UpstreamError::from_status(503, "backend unavailable")
}

fn fixed_retry(max_retries: u32) -> RetryOptions {
    RetryOptions {
        max_retries,
        base_delay_ms: 50,
        backoff_multiplier: 2.0,
        max_delay_ms: 1_000,
        jitter_ratio: 0.0,
    }
}

#[derive(Default)]
struct RecordingTransport {
    ends: AtomicU32,
}

impl StreamTransport for RecordingTransport {
    fn end(&self) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_breaker_trips_and_recovers() {
    let clock = MockClock::new();
    let breaker = CircuitBreaker::builder("chat")
        .failure_threshold(3)
        .open_duration(Duration::from_millis(1000))
        .clock(clock.clone())
        .build()
        .unwrap();

    for _ in 0..3 {
        let result = breaker.call(|| async { Err::<(), _>(server_error()) }).await;
        assert!(matches!(result, Err(BreakerError::Operation(_))));
    }
    assert_eq!(breaker.current_state(), State::Open);

    let result = breaker.call(|| async { Ok::<_, UpstreamError>("hi") }).await;
    match result {
        Err(BreakerError::Open(err)) => assert_eq!(err.name, "chat"),
        other => panic!("expected rejection, got {other:?}"),
    }

    clock.advance_millis(1001);
    let seen = Mutex::new(Vec::new());
    let result = breaker.call(|| {
        seen.lock().unwrap().push(breaker.current_state());
        async { Ok::<_, UpstreamError>("hi") }
    });
    assert_eq!(result.await.unwrap(), "hi");
    assert_eq!(*seen.lock().unwrap(), vec![State::HalfOpen]);
    assert_eq!(breaker.current_state(), State::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_trial_under_concurrency() {
    const CALLERS: u32 = 16;

    let clock = MockClock::new();
    let breaker = CircuitBreaker::builder("media")
        .failure_threshold(1)
        .open_duration(Duration::from_millis(500))
        .clock(clock.clone())
        .build()
        .unwrap();

    let _ = breaker.call(|| async { Err::<(), _>(server_error()) }).await;
    assert_eq!(breaker.current_state(), State::Open);
    clock.advance_millis(500);

    let invocations = Arc::new(AtomicU32::new(0));
    let rejected = Arc::new(AtomicU32::new(0));
    let gate = Arc::new(tokio::sync::Notify::new());

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let breaker = breaker.clone();
            let invocations = Arc::clone(&invocations);
            let rejected = Arc::clone(&rejected);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let result = breaker
                    .call(|| {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        async move {
                            gate.notified().await;
                            Ok::<_, UpstreamError>(())
                        }
                    })
                    .await;
                if matches!(result, Err(BreakerError::Open(_))) {
                    rejected.fetch_add(1, Ordering::SeqCst);
                }
                result.is_ok()
            })
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(5), async {
        while rejected.load(Ordering::SeqCst) < CALLERS - 1 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("other callers should be rejected while the trial runs");
    gate.notify_one();

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap() {
            succeeded += 1;
        }
    }

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(succeeded, 1);
    assert_eq!(breaker.current_state(), State::Closed);
    assert_eq!(breaker.get_stats().total_rejections, u64::from(CALLERS - 1));
}

#[tokio::test(start_paused = true)]
async fn test_retry_inside_breaker_counts_once() {
    let clock = MockClock::new();
    let breaker = CircuitBreaker::builder("chat")
        .failure_threshold(2)
        .clock(clock.clone())
        .build()
        .unwrap();
    let backend = ProtectedBackend::new(
        "http://127.0.0.1:11434",
        breaker,
        RetryPolicy::new(fixed_retry(3)),
    );
    let attempts = AtomicU32::new(0);

    let err = backend
        .call(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(server_error()) }
        })
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(err.response_status(), 503);
    let raw = err.into_operation().unwrap().into_inner();
    assert_eq!(raw.status(), Some(503));
    assert_eq!(backend.breaker().get_stats().failure_count, 1);
    assert_eq!(backend.breaker().current_state(), State::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_is_attempted_once() {
    let policy = RetryPolicy::<UpstreamError>::new(fixed_retry(10));
    let attempts = AtomicU32::new(0);

    let err = with_retry(
        || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(UpstreamError::from_status(404, "model not found")) }
        },
        &policy,
    )
    .await
    .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(err.attempts(), 1);
    assert_eq!(err.error().response_status(), 404);
}

#[test]
fn test_stream_close_paths_end_transport_once() {
    let clock = MockClock::new();
    let manager = ResourceManager::with_parts(
        StreamSettings::default(),
        Arc::new(clock.clone()),
        Arc::new(NullMetricSink),
    );

    let normal = Arc::new(RecordingTransport::default());
    let id = manager.register_stream(&normal, Duration::from_millis(100));
    assert!(manager.close_stream(id));
    assert!(!manager.close_stream(id));
    clock.advance_millis(101);
    assert_eq!(manager.sweep_once(), 0);
    assert_eq!(normal.ends.load(Ordering::SeqCst), 1);

    let idle = Arc::new(RecordingTransport::default());
    let id = manager.register_stream(&idle, Duration::from_millis(100));
    clock.advance_millis(101);
    let before = manager.get_stats().total_force_closed;
    assert_eq!(manager.sweep_once(), 1);
    assert!(!manager.close_stream(id));
    assert_eq!(idle.ends.load(Ordering::SeqCst), 1);
    assert_eq!(manager.get_stats().total_force_closed, before + 1);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_tick_reclaims_idle_stream() {
    let settings = StreamSettings {
        sweep_interval_ms: 1_000,
        idle_timeout_ms: 5_000,
    };
    let manager =
        ResourceManager::spawn(settings, Arc::new(SystemClock), Arc::new(NullMetricSink)).unwrap();
    let transport = Arc::new(RecordingTransport::default());
    manager.register_stream(&transport, manager.default_idle_timeout());

    tokio::time::sleep(Duration::from_millis(5_500)).await;
    assert_eq!(transport.ends.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(transport.ends.load(Ordering::SeqCst), 1);
    assert_eq!(manager.get_stats().total_force_closed, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_registry_reset_all_twice() {
    let registry = BreakerRegistry::new();
    for name in ["chat", "media", "embed"] {
        CircuitBreaker::builder(name)
            .failure_threshold(1)
            .register(&registry)
            .unwrap();
    }
    for name in ["chat", "media", "embed"] {
        let _ = registry
            .get(name)
            .unwrap()
            .call(|| async { Err::<(), _>(server_error()) })
            .await;
    }
    assert_eq!(registry.get_health_status().status, HealthStatus::Unhealthy);

    assert_eq!(registry.reset_all(), ResetSummary { reset_count: 3 });
    assert_eq!(registry.reset_all(), ResetSummary { reset_count: 3 });
    let report = registry.get_health_status();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.detail.closed, 3);
}

#[derive(Debug, Clone)]
enum Step {
    Succeed,
    Fail,
    Wait(u64),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Succeed),
        Just(Step::Fail),
        (0u64..1_500).prop_map(Step::Wait),
    ]
}

proptest! {
    #[test]
    fn test_state_machine_only_follows_allowed_edges(
        failure_threshold in 1u32..4,
        success_threshold in 1u32..3,
        steps in proptest::collection::vec(step(), 1..60),
    ) {
        let clock = MockClock::new();
        let edges = Arc::new(Mutex::new(Vec::new()));
        let hooks = HookRegistry::new();
        {
            let edges = Arc::clone(&edges);
            hooks.set_on_transition(move |_, from, to| edges.lock().unwrap().push((from, to)));
        }
        let breaker = CircuitBreaker::builder("prop")
            .failure_threshold(failure_threshold)
            .success_threshold(success_threshold)
            .open_duration(Duration::from_millis(1_000))
            .clock(clock.clone())
            .hooks(hooks)
            .build()
            .unwrap();

        for step in steps {
            let before = breaker.get_stats();
            let invoked = AtomicU32::new(0);
            let outcome = match step {
                Step::Wait(ms) => {
                    clock.advance_millis(ms);
                    continue;
                }
                Step::Succeed => tokio_test::block_on(breaker.call(|| {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, UpstreamError>(()) }
                })).map(|_| ()),
                Step::Fail => tokio_test::block_on(breaker.call(|| {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(server_error()) }
                })),
            };

            if let Some(next_attempt_at) = before.next_attempt_at {
                if clock.millis_since_epoch() < next_attempt_at {
                    prop_assert_eq!(invoked.load(Ordering::SeqCst), 0);
                    prop_assert!(matches!(outcome, Err(BreakerError::Open(_))));
                }
            }
        }

        let edges = edges.lock().unwrap();
        let mut current = State::Closed;
        for &(from, to) in edges.iter() {
            prop_assert_eq!(from, current);
            prop_assert!(from.can_transition_to(to), "illegal edge {} -> {}", from, to);
            current = to;
        }
        prop_assert_eq!(breaker.current_state(), current);
    }
}
