//! Retry, drop and shutdown behaviour of the worker pool.

use std::sync::Arc;
use std::time::Duration;

use courier::dispatcher::{Dispatcher, RetryPolicy};
use courier::event::DeliveryTask;
use courier::queue::DeliveryQueue;
use courier::sinks::{DeliveryError, SinkAdapter};
use courier::stats::{Counter, PipelineStats};

use crate::mock_sink::{event, ScriptedSink};

struct Harness {
    queue: Arc<DeliveryQueue>,
    stats: Arc<PipelineStats>,
    sink: Arc<ScriptedSink>,
    dispatcher: Dispatcher,
}

fn harness(sink: ScriptedSink, policy: RetryPolicy) -> Harness {
    let stats = Arc::new(PipelineStats::new());
    let queue = Arc::new(DeliveryQueue::new(16, Arc::clone(&stats)));
    let sink = Arc::new(sink);
    let dispatcher = Dispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&sink) as Arc<dyn SinkAdapter>,
        policy,
        Arc::clone(&stats),
    );
    Harness {
        queue,
        stats,
        sink,
        dispatcher,
    }
}

fn transient() -> DeliveryError {
    DeliveryError::Transient("status 503: busy".to_owned())
}

async fn run_to_completion(h: &Harness, workers: usize) {
    let handles = h.dispatcher.spawn(workers);
    h.queue.close();
    h.queue.wait_idle().await;
    for handle in handles {
        assert!(handle.await.is_ok(), "worker should not panic");
    }
}

#[tokio::test(start_paused = true)]
async fn retry_delays_strictly_increase() {
    let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(60), 5);
    let sink = ScriptedSink::new(vec![Err(transient()), Err(transient()), Err(transient())], Ok(()));
    let h = harness(sink, policy);

    assert!(h.queue.enqueue(DeliveryTask::new(event(1, 1, "hi"))).await.is_ok());
    run_to_completion(&h, 1).await;

    let calls = h.sink.calls();
    assert_eq!(calls.len(), 4);
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].0.duration_since(w[0].0)).collect();
    for pair in gaps.windows(2) {
        assert!(pair[1] > pair[0], "gaps should increase: {gaps:?}");
    }
    assert!(gaps[0] >= Duration::from_millis(100));
    assert!(gaps[0] < Duration::from_millis(150));

    assert_eq!(h.stats.get(Counter::Retried), 3);
    assert_eq!(h.stats.get(Counter::Delivered), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_after_max_plus_one_failures() {
    let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_secs(1), 2);
    let h = harness(ScriptedSink::always(transient()), policy);

    assert!(h.queue.enqueue(DeliveryTask::new(event(1, 1, "hi"))).await.is_ok());
    run_to_completion(&h, 2).await;

    assert_eq!(h.sink.call_count(), 3);
    assert_eq!(h.stats.get(Counter::Retried), 2);
    assert_eq!(h.stats.get(Counter::FailedExhausted), 1);
    assert_eq!(h.stats.get(Counter::Delivered), 0);
    assert_eq!(h.queue.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_never_retried() {
    let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_secs(1), 5);
    let h = harness(
        ScriptedSink::always(DeliveryError::Permanent("status 400: bad".to_owned())),
        policy,
    );

    assert!(h.queue.enqueue(DeliveryTask::new(event(1, 1, "hi"))).await.is_ok());
    run_to_completion(&h, 1).await;

    assert_eq!(h.sink.call_count(), 1);
    assert_eq!(h.stats.get(Counter::FailedPermanent), 1);
    assert_eq!(h.stats.get(Counter::Retried), 0);
}

#[tokio::test(start_paused = true)]
async fn retry_rejoins_queue_behind_newer_tasks() {
    let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_secs(1), 3);
    let sink = ScriptedSink::new(vec![Err(transient())], Ok(())).with_latency(Duration::from_millis(20));
    let h = harness(sink, policy);

    for id in 0..3 {
        assert!(h.queue.enqueue(DeliveryTask::new(event(1, id, "x"))).await.is_ok());
    }
    run_to_completion(&h, 1).await;

    let order: Vec<i64> = h.sink.calls().into_iter().map(|(_, id)| id).collect();
    assert_eq!(order, vec![0, 1, 2, 0]);
    assert_eq!(h.stats.get(Counter::Delivered), 3);
}

#[tokio::test(start_paused = true)]
async fn abort_cancels_pending_retry_and_counts_it() {
    let policy = RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(60), 5);
    let h = harness(ScriptedSink::always(transient()), policy);

    assert!(h.queue.enqueue(DeliveryTask::new(event(1, 1, "hi"))).await.is_ok());
    let handles = h.dispatcher.spawn(1);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.sink.call_count(), 1);

    let remaining = h.queue.abort();
    assert!(remaining.is_empty());
    h.queue.wait_idle().await;
    for handle in handles {
        assert!(handle.await.is_ok());
    }

    assert_eq!(h.stats.get(Counter::DroppedOnShutdown), 1);
    assert_eq!(h.sink.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn abort_cancels_in_flight_send() {
    let policy = RetryPolicy::default();
    let h = harness(ScriptedSink::ok().with_latency(Duration::from_secs(60)), policy);

    assert!(h.queue.enqueue(DeliveryTask::new(event(1, 1, "hi"))).await.is_ok());
    let handles = h.dispatcher.spawn(1);
    tokio::time::sleep(Duration::from_secs(1)).await;

    h.queue.abort();
    h.queue.wait_idle().await;
    for handle in handles {
        assert!(handle.await.is_ok());
    }
    assert_eq!(h.stats.get(Counter::DroppedOnShutdown), 1);
    assert_eq!(h.stats.get(Counter::Delivered), 0);
}
