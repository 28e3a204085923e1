//! Registry of in-flight streaming responses with an idle sweep.
//!
//! A stream can leave the registry three ways: the handler closes it on
//! normal completion, the handler closes it from an error path, or the
//! periodic sweep force-closes it after it has been idle too long. Whichever
//! path removes the entry first is the one that ends the transport, so the
//! transport is ended exactly once no matter how the paths interleave.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::metrics::{MetricSink, NullMetricSink};
use crate::settings::StreamSettings;

/// The object a streaming response is written to.
pub trait StreamTransport: Send + Sync + 'static {
    /// Terminates the response. Called at most once by the registry.
    fn end(&self);
}

/// Identifier of a registered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamId(u64);

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Identity of a transport object, derived from its allocation address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TransportKey(usize);

impl TransportKey {
    fn of<T: StreamTransport>(transport: &Arc<T>) -> Self {
        TransportKey(Arc::as_ptr(transport) as *const () as usize)
    }
}

/// Selects a stream either by id or by its transport object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTarget {
    /// By registry id.
    Id(StreamId),
    /// By the transport passed to `register_stream`.
    Transport(TransportKeyRef),
}

/// Opaque reference to a registered transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportKeyRef(TransportKey);

impl From<StreamId> for StreamTarget {
    fn from(id: StreamId) -> Self {
        StreamTarget::Id(id)
    }
}

impl<T: StreamTransport> From<&Arc<T>> for StreamTarget {
    fn from(transport: &Arc<T>) -> Self {
        StreamTarget::Transport(TransportKeyRef(TransportKey::of(transport)))
    }
}

struct StreamEntry {
    id: StreamId,
    key: TransportKey,
    // Non-owning: the handler keeps the transport alive, the registry only
    // ends it.
    transport: Weak<dyn StreamTransport>,
    registered_at: Instant,
    last_activity: Mutex<Instant>,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl StreamEntry {
    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.idle_for(now) > self.idle_timeout || self.transport.strong_count() == 0
    }
}

#[derive(Default)]
struct Streams {
    entries: AHashMap<StreamId, Arc<StreamEntry>>,
    by_transport: AHashMap<TransportKey, StreamId>,
}

/// Counters reported by [`ResourceManager::get_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    /// Streams currently registered.
    pub active_streams: usize,
    /// Streams ever registered.
    pub total_registered: u64,
    /// Streams closed by the handler or the forwarding task.
    pub total_closed: u64,
    /// Streams closed by the idle sweep.
    pub total_force_closed: u64,
}

/// How a forwarding task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The source ran out of chunks.
    Completed,
    /// The consumer dropped its receiver.
    ConsumerGone,
    /// The stream was closed from elsewhere (handler, sweep, shutdown).
    Cancelled,
}

/// Tracks streaming responses and reclaims the ones that go idle.
pub struct ResourceManager {
    streams: Mutex<Streams>,
    next_id: AtomicU64,
    total_registered: AtomicU64,
    total_closed: AtomicU64,
    total_force_closed: AtomicU64,
    settings: StreamSettings,
    clock: Arc<dyn Clock>,
    metric_sink: Arc<dyn MetricSink>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceManager {
    /// Creates a registry without a background sweep; drive it with
    /// [`sweep_once`](Self::sweep_once).
    pub fn new(settings: StreamSettings) -> Self {
        Self::with_parts(settings, Arc::new(SystemClock), Arc::new(NullMetricSink))
    }

    /// Creates a registry with an explicit clock and metric sink.
    pub fn with_parts(
        settings: StreamSettings,
        clock: Arc<dyn Clock>,
        metric_sink: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            streams: Mutex::new(Streams::default()),
            next_id: AtomicU64::new(1),
            total_registered: AtomicU64::new(0),
            total_closed: AtomicU64::new(0),
            total_force_closed: AtomicU64::new(0),
            settings,
            clock,
            metric_sink,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Creates a registry and starts its periodic sweep on the current tokio
    /// runtime. The sweep stops on [`shutdown`](Self::shutdown) or when the
    /// last `Arc` is dropped.
    ///
    /// Fails without spawning anything when the sweep period is zero.
    pub fn spawn(
        settings: StreamSettings,
        clock: Arc<dyn Clock>,
        metric_sink: Arc<dyn MetricSink>,
    ) -> Result<Arc<Self>, ConfigError> {
        settings.validate()?;
        let manager = Arc::new(Self::with_parts(settings, clock, metric_sink));
        let handle = tokio::spawn(sweep_loop(
            Arc::downgrade(&manager),
            manager.settings.sweep_interval(),
            manager.shutdown.clone(),
        ));
        *manager.sweeper.lock() = Some(handle);
        Ok(manager)
    }

    /// Idle timeout configured as the default.
    pub fn default_idle_timeout(&self) -> Duration {
        self.settings.idle_timeout()
    }

    /// Starts tracking `transport`. Registering the same transport again
    /// returns the existing id.
    pub fn register_stream<T: StreamTransport>(
        &self,
        transport: &Arc<T>,
        idle_timeout: Duration,
    ) -> StreamId {
        let key = TransportKey::of(transport);
        let now = self.clock.now();

        let id = {
            let mut streams = self.streams.lock();
            if let Some(existing) = streams.by_transport.get(&key) {
                return *existing;
            }

            let id = StreamId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let weak: Weak<T> = Arc::downgrade(transport);
            let weak: Weak<dyn StreamTransport> = weak;
            let entry = StreamEntry {
                id,
                key,
                transport: weak,
                registered_at: now,
                last_activity: Mutex::new(now),
                idle_timeout,
                cancel: self.shutdown.child_token(),
            };
            streams.entries.insert(id, Arc::new(entry));
            streams.by_transport.insert(key, id);
            id
        };

        self.total_registered.fetch_add(1, Ordering::Relaxed);
        self.metric_sink.record_stream_registered();
        debug!(stream = %id, idle_timeout_ms = idle_timeout.as_millis() as u64, "stream registered");
        id
    }

    /// Records activity on a stream, postponing its idle deadline. Returns
    /// `false` if the stream is no longer registered.
    pub fn touch(&self, id: StreamId) -> bool {
        let entry = self.streams.lock().entries.get(&id).cloned();
        match entry {
            Some(entry) => {
                *entry.last_activity.lock() = self.clock.now();
                true
            }
            None => false,
        }
    }

    /// Whether `target` is still registered.
    pub fn is_registered(&self, target: impl Into<StreamTarget>) -> bool {
        let streams = self.streams.lock();
        resolve(&streams, target.into()).is_some()
    }

    /// Removes the stream and ends its transport. Closing an unknown or
    /// already-closed stream is a no-op; returns whether this call closed it.
    pub fn close_stream(&self, target: impl Into<StreamTarget>) -> bool {
        self.remove_and_end(target.into(), None)
    }

    /// Force-closes every stream idle longer than its timeout. Returns how
    /// many were closed.
    pub fn sweep_once(&self) -> usize {
        let now = self.clock.now();
        let expired: SmallVec<[StreamId; 8]> = {
            let streams = self.streams.lock();
            streams
                .entries
                .values()
                .filter(|entry| entry.is_expired(now))
                .map(|entry| entry.id)
                .collect()
        };

        expired
            .into_iter()
            .filter(|id| self.remove_and_end(StreamTarget::Id(*id), Some(now)))
            .count()
    }

    /// Forwards chunks from `source` to `sink` on a separate task, recording
    /// activity for every delivered chunk.
    ///
    /// The stream is closed when the source finishes or the consumer goes
    /// away; the task stops early if the stream is closed from anywhere else.
    pub fn forward<S, T>(
        self: &Arc<Self>,
        id: StreamId,
        source: S,
        sink: mpsc::Sender<T>,
    ) -> JoinHandle<ForwardOutcome>
    where
        S: Stream<Item = T> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = self
            .streams
            .lock()
            .entries
            .get(&id)
            .map(|entry| entry.cancel.clone());
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let Some(cancel) = cancel else {
                return ForwardOutcome::Cancelled;
            };

            let mut source = std::pin::pin!(source);
            let outcome = loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break ForwardOutcome::Cancelled,
                    chunk = source.next() => chunk,
                };
                let Some(chunk) = chunk else {
                    break ForwardOutcome::Completed;
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break ForwardOutcome::Cancelled,
                    sent = sink.send(chunk) => {
                        if sent.is_err() {
                            break ForwardOutcome::ConsumerGone;
                        }
                    }
                }
                manager.touch(id);
            };

            manager.close_stream(id);
            debug!(stream = %id, ?outcome, "forwarding finished");
            outcome
        })
    }

    /// Current counters.
    pub fn get_stats(&self) -> StreamStats {
        StreamStats {
            active_streams: self.streams.lock().entries.len(),
            total_registered: self.total_registered.load(Ordering::Relaxed),
            total_closed: self.total_closed.load(Ordering::Relaxed),
            total_force_closed: self.total_force_closed.load(Ordering::Relaxed),
        }
    }

    /// Stops the sweep and closes every stream still registered.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "stream sweeper did not stop cleanly");
            }
        }

        let remaining: Vec<StreamId> = self.streams.lock().entries.keys().copied().collect();
        let count = remaining.len();
        for id in remaining {
            self.close_stream(id);
        }
        info!(closed = count, "stream registry shut down");
    }

    /// Single point of removal. `idle_check` carries the sweep's notion of
    /// "now"; when set, the entry is only removed if it is still expired.
    fn remove_and_end(&self, target: StreamTarget, idle_check: Option<Instant>) -> bool {
        let entry = {
            let mut streams = self.streams.lock();
            let Some(id) = resolve(&streams, target) else {
                return false;
            };
            if let Some(now) = idle_check {
                match streams.entries.get(&id) {
                    Some(entry) if entry.is_expired(now) => {}
                    _ => return false,
                }
            }
            let Some(entry) = streams.entries.remove(&id) else {
                return false;
            };
            streams.by_transport.remove(&entry.key);
            entry
        };

        entry.cancel.cancel();
        if let Some(transport) = entry.transport.upgrade() {
            transport.end();
        }

        let forced = idle_check.is_some();
        if forced {
            self.total_force_closed.fetch_add(1, Ordering::Relaxed);
            let now = self.clock.now();
            warn!(
                stream = %entry.id,
                idle_ms = entry.idle_for(now).as_millis() as u64,
                age_ms = now.saturating_duration_since(entry.registered_at).as_millis() as u64,
                "force-closed idle stream"
            );
        } else {
            self.total_closed.fetch_add(1, Ordering::Relaxed);
            debug!(stream = %entry.id, "stream closed");
        }
        self.metric_sink.record_stream_closed(forced);
        true
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn resolve(streams: &Streams, target: StreamTarget) -> Option<StreamId> {
    match target {
        StreamTarget::Id(id) => streams.entries.contains_key(&id).then_some(id),
        StreamTarget::Transport(TransportKeyRef(key)) => streams.by_transport.get(&key).copied(),
    }
}

async fn sweep_loop(manager: Weak<ResourceManager>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let closed = manager.sweep_once();
                if closed > 0 {
                    debug!(closed, "idle sweep reclaimed streams");
                }
            }
        }
    }
    debug!("stream sweeper stopped");
}
