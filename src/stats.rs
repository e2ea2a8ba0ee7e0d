//! Lock-free pipeline counters.
//!
//! Every drop and terminal failure increments a counter here in addition to
//! its log line, so losses are visible in the shutdown report.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Which counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Event read from the source.
    Received,
    /// Event rejected by the filter.
    Filtered,
    /// Event accepted into the queue.
    Enqueued,
    /// Event delivered by the sink.
    Delivered,
    /// Failed attempt scheduled for retry.
    Retried,
    /// Event dropped after a permanent failure.
    FailedPermanent,
    /// Event dropped after exhausting its retries.
    FailedExhausted,
    /// Oldest queued event evicted to make room.
    DroppedOverflow,
    /// Event abandoned because shutdown's grace period ran out.
    DroppedOnShutdown,
}

/// Shared counters for one service run.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    filtered: AtomicU64,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    failed_permanent: AtomicU64,
    failed_exhausted: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_on_shutdown: AtomicU64,
}

impl PipelineStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn record(&self, counter: Counter) {
        self.add(counter, 1);
    }

    /// Increment a counter by `n`.
    pub fn add(&self, counter: Counter, n: u64) {
        self.slot(counter).fetch_add(n, Ordering::Relaxed);
    }

    /// Current value of a counter.
    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.get(Counter::Received),
            filtered: self.get(Counter::Filtered),
            enqueued: self.get(Counter::Enqueued),
            delivered: self.get(Counter::Delivered),
            retried: self.get(Counter::Retried),
            failed_permanent: self.get(Counter::FailedPermanent),
            failed_exhausted: self.get(Counter::FailedExhausted),
            dropped_overflow: self.get(Counter::DroppedOverflow),
            dropped_on_shutdown: self.get(Counter::DroppedOnShutdown),
        }
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Received => &self.received,
            Counter::Filtered => &self.filtered,
            Counter::Enqueued => &self.enqueued,
            Counter::Delivered => &self.delivered,
            Counter::Retried => &self.retried,
            Counter::FailedPermanent => &self.failed_permanent,
            Counter::FailedExhausted => &self.failed_exhausted,
            Counter::DroppedOverflow => &self.dropped_overflow,
            Counter::DroppedOnShutdown => &self.dropped_on_shutdown,
        }
    }
}

/// Copy of [`PipelineStats`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Events read from the source.
    pub received: u64,
    /// Events rejected by the filter.
    pub filtered: u64,
    /// Events accepted into the queue.
    pub enqueued: u64,
    /// Events delivered.
    pub delivered: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Events dropped after a permanent failure.
    pub failed_permanent: u64,
    /// Events dropped after exhausting retries.
    pub failed_exhausted: u64,
    /// Events evicted from a full queue.
    pub dropped_overflow: u64,
    /// Events abandoned at shutdown.
    pub dropped_on_shutdown: u64,
}

impl StatsSnapshot {
    /// Events that left the pipeline without being delivered.
    pub fn lost(&self) -> u64 {
        self.failed_permanent
            .saturating_add(self.failed_exhausted)
            .saturating_add(self.dropped_overflow)
            .saturating_add(self.dropped_on_shutdown)
    }
}
