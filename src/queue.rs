//! Bounded FIFO between the event source and the dispatcher workers.
//!
//! The queue never holds more than its capacity. Producers that can pause use
//! [`DeliveryQueue::enqueue`], which waits for space. Producers that cannot
//! pause use [`DeliveryQueue::enqueue_or_evict`], which waits a bounded time
//! and then evicts the oldest entry, counting the eviction.
//!
//! The queue also tracks *outstanding* tasks: accepted events that have not
//! yet reached a terminal outcome, including tasks currently held by a worker
//! or sleeping in a retry backoff. Draining is complete when that count is
//! zero, not merely when the buffer is empty.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::warn;

use crate::event::DeliveryTask;
use crate::stats::{Counter, PipelineStats};

/// Queue operation refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue no longer accepts new events (draining or stopped).
    #[error("delivery queue is closed")]
    Closed,
}

/// Result of a bounded-wait enqueue.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// The task was queued without loss.
    Queued,
    /// The task was queued after evicting the returned oldest task.
    Evicted(Box<DeliveryTask>),
}

#[derive(Default)]
struct State {
    tasks: VecDeque<DeliveryTask>,
    outstanding: usize,
    closed: bool,
    aborted: bool,
}

/// Bounded, closable delivery queue. See the module docs.
pub struct DeliveryQueue {
    state: Mutex<State>,
    capacity: usize,
    stats: Arc<PipelineStats>,
    not_empty: Notify,
    not_full: Notify,
    idle: Notify,
    abort: Notify,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("DeliveryQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.tasks.len())
            .field("outstanding", &state.outstanding)
            .field("closed", &state.closed)
            .field("aborted", &state.aborted)
            .finish()
    }
}

impl DeliveryQueue {
    /// Create an empty queue. A zero capacity is treated as one.
    pub fn new(capacity: usize, stats: Arc<PipelineStats>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            capacity: capacity.max(1),
            stats,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            idle: Notify::new(),
            abort: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Maximum number of buffered tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered tasks.
    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Whether no task is buffered.
    pub fn is_empty(&self) -> bool {
        self.lock().tasks.is_empty()
    }

    /// Accepted tasks without a terminal outcome yet.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Whether new events are refused.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Queue a new event, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the queue is or becomes closed.
    pub async fn enqueue(&self, task: DeliveryTask) -> Result<(), QueueError> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed || state.aborted {
                    return Err(QueueError::Closed);
                }
                if state.tasks.len() < self.capacity {
                    state.tasks.push_back(task);
                    state.outstanding = state.outstanding.saturating_add(1);
                    drop(state);
                    self.stats.record(Counter::Enqueued);
                    self.not_empty.notify_waiters();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Queue a new event, evicting the oldest entry if no space frees up
    /// within `wait`.
    ///
    /// Every eviction increments [`Counter::DroppedOverflow`] and is logged.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the queue is or becomes closed.
    pub async fn enqueue_or_evict(
        &self,
        task: DeliveryTask,
        wait: Duration,
    ) -> Result<EnqueueOutcome, QueueError> {
        let deadline = tokio::time::Instant::now()
            .checked_add(wait)
            .unwrap_or_else(tokio::time::Instant::now);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed || state.aborted {
                    return Err(QueueError::Closed);
                }
                if state.tasks.len() < self.capacity {
                    state.tasks.push_back(task);
                    state.outstanding = state.outstanding.saturating_add(1);
                    drop(state);
                    self.stats.record(Counter::Enqueued);
                    self.not_empty.notify_waiters();
                    return Ok(EnqueueOutcome::Queued);
                }
                if tokio::time::Instant::now() >= deadline {
                    // One out, one in: the outstanding count is unchanged.
                    let evicted = state.tasks.pop_front();
                    state.tasks.push_back(task);
                    drop(state);
                    self.stats.record(Counter::Enqueued);
                    self.not_empty.notify_waiters();
                    return Ok(match evicted {
                        Some(old) => {
                            self.stats.record(Counter::DroppedOverflow);
                            warn!(
                                origin_id = old.event.origin_id,
                                message_id = old.event.message_id,
                                attempt = old.attempt,
                                capacity = self.capacity,
                                "queue full, dropped oldest event"
                            );
                            EnqueueOutcome::Evicted(Box::new(old))
                        }
                        None => EnqueueOutcome::Queued,
                    });
                }
            }

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Put a retried task back at the tail, waiting while the queue is full.
    ///
    /// Accepted while draining; refused only once the queue is aborted, in
    /// which case the task is handed back.
    ///
    /// # Errors
    ///
    /// Returns the task when the queue has been aborted.
    pub async fn requeue(&self, task: DeliveryTask) -> Result<(), Box<DeliveryTask>> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.aborted {
                    return Err(Box::new(task));
                }
                if state.tasks.len() < self.capacity {
                    state.tasks.push_back(task);
                    drop(state);
                    self.not_empty.notify_waiters();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Take the oldest task, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is aborted, or closed with nothing left
    /// outstanding.
    pub async fn dequeue(&self) -> Option<DeliveryTask> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.aborted {
                    return None;
                }
                if let Some(task) = state.tasks.pop_front() {
                    drop(state);
                    self.not_full.notify_waiters();
                    return Some(task);
                }
                if state.closed && state.outstanding == 0 {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Record that a task reached a terminal outcome.
    pub fn complete(&self) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        let idle = state.outstanding == 0;
        let closed = state.closed;
        drop(state);
        if idle {
            self.idle.notify_waiters();
            if closed {
                self.not_empty.notify_waiters();
            }
        }
    }

    /// Refuse new events. Buffered and in-flight tasks keep draining.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
        self.idle.notify_waiters();
    }

    /// Stop everything: wake all waiters and hand back the buffered tasks.
    ///
    /// Buffered tasks count as completed; callers account for them.
    pub fn abort(&self) -> Vec<DeliveryTask> {
        let mut state = self.lock();
        state.closed = true;
        state.aborted = true;
        let remaining: Vec<DeliveryTask> = state.tasks.drain(..).collect();
        state.outstanding = state.outstanding.saturating_sub(remaining.len());
        drop(state);
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
        self.idle.notify_waiters();
        self.abort.notify_waiters();
        remaining
    }

    /// Wait until no task is outstanding.
    ///
    /// After [`abort`](Self::abort) this still waits for in-flight deliveries
    /// and pending retries to settle, which they do promptly.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().outstanding == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Resolve once [`abort`](Self::abort) has been called.
    pub async fn aborted(&self) {
        loop {
            let notified = self.abort.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().aborted {
                return;
            }
            notified.await;
        }
    }
}
