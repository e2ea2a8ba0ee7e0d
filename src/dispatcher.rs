//! Worker pool that drains the delivery queue into the configured sink.
//!
//! Each worker takes one task at a time. Transient failures are retried with
//! exponential backoff: the task sleeps in a detached timer and then rejoins
//! the tail of the queue, so the worker is free to keep draining. A retried
//! task therefore lands behind whatever arrived meanwhile; ordering per origin
//! is not preserved across retries and sinks must tolerate that.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event::DeliveryTask;
use crate::queue::DeliveryQueue;
use crate::sinks::SinkAdapter;
use crate::stats::{Counter, PipelineStats};

/// Exponential backoff with a ceiling and bounded jitter.
///
/// The delay before retry `n` (counting from zero) is
/// `min(base * 2^n, max_delay)` plus a jitter below `base / 2`. Because each
/// doubling adds at least `base`, delays strictly increase until the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    max_delay: Duration,
    max_retries: u32,
}

impl RetryPolicy {
    /// Create a policy. `max_delay` below `base` is raised to `base`.
    pub fn new(base: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_delay: max_delay.max(base),
            max_retries,
        }
    }

    /// Retries allowed after the first failed attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a task that has already failed `attempt` times before this
    /// failure gets another try.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Backoff before retry `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        2_u32
            .checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Upper bound (exclusive) of the jitter added to each delay.
    pub fn max_jitter(&self) -> Duration {
        self.base.checked_div(2).unwrap_or(Duration::ZERO)
    }

    /// Backoff before retry `attempt` with the given jitter, clamped to
    /// [`max_jitter`](Self::max_jitter).
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let jitter = jitter.min(self.max_jitter().saturating_sub(Duration::from_nanos(1)));
        self.base_delay(attempt).saturating_add(jitter)
    }

    /// Backoff before retry `attempt` with random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let max_jitter = self.max_jitter();
        let jitter = if max_jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..max_jitter)
        };
        self.delay_with_jitter(attempt, jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60), 5)
    }
}

/// Shared handles for the worker pool.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<DeliveryQueue>,
    sink: Arc<dyn SinkAdapter>,
    retry: RetryPolicy,
    stats: Arc<PipelineStats>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("sink", &self.sink.name())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher over a queue and sink.
    pub fn new(
        queue: Arc<DeliveryQueue>,
        sink: Arc<dyn SinkAdapter>,
        retry: RetryPolicy,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            queue,
            sink,
            retry,
            stats,
        }
    }

    /// Spawn `workers` worker tasks. Each exits once the queue is aborted, or
    /// closed with nothing outstanding.
    pub fn spawn(&self, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker_id| {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.run_worker(worker_id).await })
            })
            .collect()
    }

    async fn run_worker(self, worker_id: usize) {
        debug!(worker_id, sink = self.sink.name(), "dispatcher worker started");
        while let Some(task) = self.queue.dequeue().await {
            self.process(worker_id, task).await;
        }
        debug!(worker_id, "dispatcher worker stopped");
    }

    /// Deliver one task and act on the outcome.
    pub async fn process(&self, worker_id: usize, task: DeliveryTask) {
        let sink = self.sink.name();
        let event = &task.event;

        let outcome = tokio::select! {
            biased;
            () = self.queue.aborted() => None,
            result = self.sink.send(event) => Some(result),
        };

        match outcome {
            None => {
                warn!(
                    worker_id,
                    sink,
                    origin_id = event.origin_id,
                    message_id = event.message_id,
                    "in-flight delivery cancelled by shutdown"
                );
                self.stats.record(Counter::DroppedOnShutdown);
                self.queue.complete();
            }
            Some(Ok(())) => {
                info!(
                    sink,
                    origin_id = event.origin_id,
                    message_id = event.message_id,
                    attempt = task.attempt,
                    chat = %event.origin_title,
                    sender = %event.sender_name,
                    preview = %event.preview(),
                    "message forwarded"
                );
                self.stats.record(Counter::Delivered);
                self.queue.complete();
            }
            Some(Err(err)) if !err.is_retryable() => {
                error!(
                    sink,
                    origin_id = event.origin_id,
                    message_id = event.message_id,
                    attempt = task.attempt,
                    error = %err,
                    "delivery failed permanently, dropping message"
                );
                self.stats.record(Counter::FailedPermanent);
                self.queue.complete();
            }
            Some(Err(err)) if self.retry.should_retry(task.attempt) => {
                let delay = self.retry.delay(task.attempt);
                warn!(
                    sink,
                    origin_id = event.origin_id,
                    message_id = event.message_id,
                    attempt = task.attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "delivery failed, scheduling retry"
                );
                self.stats.record(Counter::Retried);
                self.schedule_retry(task.next_attempt(), delay);
            }
            Some(Err(err)) => {
                error!(
                    sink,
                    origin_id = event.origin_id,
                    message_id = event.message_id,
                    attempts = task.attempt.saturating_add(1),
                    error = %err,
                    "delivery retries exhausted, dropping message"
                );
                self.stats.record(Counter::FailedExhausted);
                self.queue.complete();
            }
        }
    }

    fn schedule_retry(&self, task: DeliveryTask, delay: Duration) {
        let queue = Arc::clone(&self.queue);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            tokio::select! {
                () = queue.aborted() => drop_on_shutdown(&queue, &stats, &task),
                () = tokio::time::sleep(delay) => {
                    if let Err(task) = queue.requeue(task).await {
                        drop_on_shutdown(&queue, &stats, &task);
                    }
                }
            }
        });
    }
}

fn drop_on_shutdown(queue: &DeliveryQueue, stats: &PipelineStats, task: &DeliveryTask) {
    warn!(
        origin_id = task.event.origin_id,
        message_id = task.event.message_id,
        attempt = task.attempt,
        "pending retry dropped on shutdown"
    );
    stats.record(Counter::DroppedOnShutdown);
    queue.complete();
}
