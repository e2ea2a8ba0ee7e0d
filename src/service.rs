//! Forwarder lifecycle: `Starting → Running → Draining → Stopped`.
//!
//! [`ForwarderService::run`] connects the source, spawns the dispatcher
//! workers and pumps events through the filter into the delivery queue until
//! the shutdown future resolves or the source ends. It then closes the source,
//! counting events it had buffered but not handed out, closes the queue, lets
//! the workers drain for the configured grace period, and abandons (and
//! counts) whatever is left.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError, PipelineConfig};
use crate::dispatcher::{Dispatcher, RetryPolicy};
use crate::event::{DeliveryTask, NormalizedEvent};
use crate::filter::{should_forward, FilterPolicy};
use crate::queue::{DeliveryQueue, EnqueueOutcome};
use crate::sinks::{build_sink, SinkAdapter};
use crate::source::{EventSource, SourceError};
use crate::stats::{Counter, PipelineStats, StatsSnapshot};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Connecting the source and spawning workers.
    Starting,
    /// Forwarding events.
    Running,
    /// Source stopped; workers finishing queued deliveries.
    Draining,
    /// Workers joined.
    Stopped,
}

/// Why the running phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown future resolved.
    Shutdown,
    /// The source reported end of stream.
    SourceEnded,
    /// The source failed and could not be reconnected.
    SourceFailed(SourceError),
}

/// Summary returned once the service has stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Why the service stopped.
    pub reason: StopReason,
    /// Whether every accepted event reached a terminal outcome before the
    /// grace period elapsed.
    pub drained: bool,
    /// Final counters.
    pub stats: StatsSnapshot,
}

/// Failure before the service reached `Running`.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The source could not be connected within the reconnect budget.
    #[error("failed to connect source {name}: {source}")]
    Connect {
        /// Source name.
        name: String,
        /// Last connection error.
        #[source]
        source: SourceError,
    },
}

enum Connection {
    Ready,
    Shutdown,
    Failed(SourceError),
}

enum Admission {
    Continue,
    Shutdown,
}

/// Wires a source through the filter and queue into one sink.
pub struct ForwarderService {
    sink: Arc<dyn SinkAdapter>,
    policy: FilterPolicy,
    pipeline: PipelineConfig,
    stats: Arc<PipelineStats>,
    state: watch::Sender<ServiceState>,
}

impl std::fmt::Debug for ForwarderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwarderService")
            .field("sink", &self.sink.name())
            .field("policy", &self.policy)
            .field("pipeline", &self.pipeline)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ForwarderService {
    /// Create a service around an already-built sink.
    pub fn new(sink: Arc<dyn SinkAdapter>, policy: FilterPolicy, pipeline: PipelineConfig) -> Self {
        let (state, _) = watch::channel(ServiceState::Starting);
        Self {
            sink,
            policy,
            pipeline,
            stats: Arc::new(PipelineStats::new()),
            state,
        }
    }

    /// Build the configured sink and wrap it in a service.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the sink cannot be constructed.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let sink = build_sink(config)?;
        Ok(Self::new(
            sink,
            config.filter.clone(),
            config.pipeline.clone(),
        ))
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Shared pipeline counters.
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    fn transition(&self, next: ServiceState) {
        let previous = self.state.send_replace(next);
        debug!(from = ?previous, to = ?next, "service state changed");
    }

    fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(RECONNECT_BASE, RECONNECT_MAX, self.pipeline.max_reconnects)
    }

    /// Run until `shutdown` resolves or the source ends, then drain.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Connect`] when the source cannot be connected
    /// at startup. Failures after that are reported in
    /// [`ShutdownReport::reason`] once the queue has drained.
    pub async fn run<F>(
        &self,
        source: &mut dyn EventSource,
        shutdown: F,
    ) -> Result<ShutdownReport, ServiceError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        self.transition(ServiceState::Starting);
        info!(
            source = source.name(),
            sink = self.sink.name(),
            filter = %self.policy.summary(),
            workers = self.pipeline.workers,
            queue_capacity = self.pipeline.queue_capacity,
            "forwarder starting"
        );

        match self.establish(source, &mut shutdown, None).await {
            Connection::Ready => {}
            Connection::Shutdown => {
                info!("shutdown requested before the source connected");
                self.discard_unread(source);
                self.transition(ServiceState::Stopped);
                return Ok(ShutdownReport {
                    reason: StopReason::Shutdown,
                    drained: true,
                    stats: self.stats.snapshot(),
                });
            }
            Connection::Failed(source_err) => {
                error!(source = source.name(), error = %source_err, "source connection failed");
                self.discard_unread(source);
                self.transition(ServiceState::Stopped);
                return Err(ServiceError::Connect {
                    name: source.name().to_owned(),
                    source: source_err,
                });
            }
        }

        let queue = Arc::new(DeliveryQueue::new(
            self.pipeline.queue_capacity,
            Arc::clone(&self.stats),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&self.sink),
            self.pipeline.retry_policy(),
            Arc::clone(&self.stats),
        );
        let workers = dispatcher.spawn(self.pipeline.workers);

        self.transition(ServiceState::Running);
        info!(source = source.name(), sink = self.sink.name(), "forwarder running");

        let backpressure = source.supports_backpressure();
        let reason = loop {
            let next = tokio::select! {
                biased;
                () = shutdown.as_mut() => break StopReason::Shutdown,
                next = source.next_event() => next,
            };

            match next {
                Ok(Some(event)) => {
                    if let Admission::Shutdown =
                        self.admit(&queue, event, backpressure, &mut shutdown).await
                    {
                        break StopReason::Shutdown;
                    }
                }
                Ok(None) => {
                    info!(source = source.name(), "source ended");
                    break StopReason::SourceEnded;
                }
                Err(err) => match self.establish(source, &mut shutdown, Some(err)).await {
                    Connection::Ready => {}
                    Connection::Shutdown => break StopReason::Shutdown,
                    Connection::Failed(err) => {
                        error!(source = source.name(), error = %err, "source lost, giving up");
                        break StopReason::SourceFailed(err);
                    }
                },
            }
        };

        self.discard_unread(source);
        let drained = self.drain(&queue).await;
        for (worker_id, handle) in workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker_id, error = %e, "dispatcher worker panicked");
            }
        }

        self.transition(ServiceState::Stopped);
        let stats = self.stats.snapshot();
        info!(
            reason = ?reason,
            drained,
            received = stats.received,
            filtered = stats.filtered,
            delivered = stats.delivered,
            retried = stats.retried,
            failed_permanent = stats.failed_permanent,
            failed_exhausted = stats.failed_exhausted,
            dropped_overflow = stats.dropped_overflow,
            dropped_on_shutdown = stats.dropped_on_shutdown,
            "forwarder stopped"
        );
        Ok(ShutdownReport {
            reason,
            drained,
            stats,
        })
    }

    /// Connect the source, retrying with backoff. With `last` set the first
    /// attempt is a reconnect after that error.
    async fn establish<F>(
        &self,
        source: &mut dyn EventSource,
        shutdown: &mut Pin<&mut F>,
        mut last: Option<SourceError>,
    ) -> Connection
    where
        F: Future<Output = ()> + Send,
    {
        let policy = self.reconnect_policy();
        let mut attempt = 0_u32;
        loop {
            if let Some(err) = last.take() {
                if err.is_fatal() || !policy.should_retry(attempt) {
                    return Connection::Failed(err);
                }
                let delay = policy.delay(attempt);
                attempt = attempt.saturating_add(1);
                warn!(
                    source = source.name(),
                    attempt,
                    max_reconnects = policy.max_retries(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "source unavailable, reconnecting"
                );
                tokio::select! {
                    biased;
                    () = shutdown.as_mut() => return Connection::Shutdown,
                    () = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                biased;
                () = shutdown.as_mut() => return Connection::Shutdown,
                result = source.connect() => result,
            };
            match result {
                Ok(()) => {
                    if attempt > 0 {
                        info!(source = source.name(), attempt, "source reconnected");
                    }
                    return Connection::Ready;
                }
                Err(err) => last = Some(err),
            }
        }
    }

    /// Filter one event and hand it to the queue.
    async fn admit<F>(
        &self,
        queue: &DeliveryQueue,
        event: NormalizedEvent,
        backpressure: bool,
        shutdown: &mut Pin<&mut F>,
    ) -> Admission
    where
        F: Future<Output = ()> + Send,
    {
        self.stats.record(Counter::Received);
        if !should_forward(&event, &self.policy) {
            self.stats.record(Counter::Filtered);
            debug!(
                origin_id = event.origin_id,
                message_id = event.message_id,
                muted = event.is_muted,
                "event filtered"
            );
            return Admission::Continue;
        }

        let origin_id = event.origin_id;
        let message_id = event.message_id;
        let task = DeliveryTask::new(event);

        let enqueue = async {
            if backpressure {
                queue.enqueue(task).await.map(|()| EnqueueOutcome::Queued)
            } else {
                queue
                    .enqueue_or_evict(task, self.pipeline.enqueue_timeout())
                    .await
            }
        };
        let accepted = tokio::select! {
            biased;
            () = shutdown.as_mut() => None,
            result = enqueue => Some(result),
        };

        match accepted {
            Some(Ok(_)) => {
                debug!(origin_id, message_id, "event queued");
                Admission::Continue
            }
            Some(Err(e)) => {
                // Only reachable once the queue is closed, which happens after
                // the running loop exits.
                warn!(origin_id, message_id, error = %e, "event refused by queue");
                self.stats.record(Counter::DroppedOnShutdown);
                Admission::Shutdown
            }
            None => {
                warn!(
                    origin_id,
                    message_id,
                    "event dropped on shutdown while waiting for queue space"
                );
                self.stats.record(Counter::DroppedOnShutdown);
                Admission::Shutdown
            }
        }
    }

    /// Close the source and count what it still held. Filtered events are
    /// counted as filtered, the rest as dropped on shutdown.
    fn discard_unread(&self, source: &mut dyn EventSource) {
        let unread = source.close();
        if unread.is_empty() {
            return;
        }

        let mut dropped = 0_u64;
        for event in &unread {
            self.stats.record(Counter::Received);
            if !should_forward(event, &self.policy) {
                self.stats.record(Counter::Filtered);
                continue;
            }
            warn!(
                origin_id = event.origin_id,
                message_id = event.message_id,
                "unread event dropped on shutdown"
            );
            self.stats.record(Counter::DroppedOnShutdown);
            dropped = dropped.saturating_add(1);
        }
        warn!(
            source = source.name(),
            unread = unread.len(),
            dropped,
            "source closed with unread events"
        );
    }

    /// Close the queue and wait for the workers to finish. Returns whether
    /// everything drained within the grace period.
    async fn drain(&self, queue: &DeliveryQueue) -> bool {
        self.transition(ServiceState::Draining);
        queue.close();
        let grace = self.pipeline.shutdown_grace();
        info!(
            outstanding = queue.outstanding(),
            grace_secs = grace.as_secs(),
            "draining delivery queue"
        );

        if tokio::time::timeout(grace, queue.wait_idle()).await.is_ok() {
            info!("delivery queue drained");
            return true;
        }

        let remaining = queue.abort();
        for task in &remaining {
            warn!(
                origin_id = task.event.origin_id,
                message_id = task.event.message_id,
                attempt = task.attempt,
                "undelivered event dropped on shutdown"
            );
        }
        self.stats.add(
            Counter::DroppedOnShutdown,
            u64::try_from(remaining.len()).unwrap_or(u64::MAX),
        );
        // In-flight sends and pending retries observe the abort and settle.
        queue.wait_idle().await;
        error!(
            abandoned = remaining.len(),
            grace_secs = grace.as_secs(),
            "shutdown grace period elapsed before the queue drained"
        );
        false
    }
}

/// Resolve on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(()) => info!("received SIGINT, shutting down"),
                        Err(e) => error!(error = %e, "failed to listen for SIGINT, shutting down"),
                    },
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received SIGINT, shutting down"),
        Err(e) => {
            error!(error = %e, "failed to listen for SIGINT, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
