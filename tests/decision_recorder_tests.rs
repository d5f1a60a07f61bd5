mod common;

use std::time::Duration;

use tokio::time::Instant;

use common::{recorder, recorder_config, trace};
use danci_amas::db::memory::RecordStatus;
use danci_amas::services::decision_recorder::feature_hash;

#[tokio::test(start_paused = true)]
async fn duplicate_decision_id_is_stored_once() {
    let h = recorder(recorder_config(100));

    h.recorder.record(trace("dec-1")).await;
    h.recorder.record(trace("dec-1")).await;
    h.recorder.flush_now().await;

    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RecordStatus::Success);
    assert_eq!(h.store.stages("dec-1").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_records_of_one_decision_id_store_one_row() {
    let h = recorder(recorder_config(100));
    let left = h.recorder.clone();
    let right = h.recorder.clone();

    tokio::join!(left.record(trace("dec-1")), right.record(trace("dec-1")));
    tokio::join!(left.flush_now(), right.flush_now());

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..4 {
        let recorder = h.recorder.clone();
        tasks.spawn(async move {
            recorder.record(trace("dec-1")).await;
            recorder.flush_now().await;
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }
    h.recorder.flush_now().await;

    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].trace.decision_id, "dec-1");
    assert_eq!(records[0].status, RecordStatus::Success);
    assert_eq!(h.store.stages("dec-1").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn retries_then_success_leaves_no_failed_marker() {
    let h = recorder(recorder_config(100));
    h.store.fail_next_persists(3);

    h.recorder.record(trace("dec-1")).await;
    h.recorder.flush_now().await;

    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RecordStatus::Success);
    assert!(records[0].error.is_none());
    assert_eq!(h.store.persist_calls(), 4);

    let metrics = h.metrics.snapshot();
    assert_eq!(metrics.recorder_retries, 3);
    assert_eq!(metrics.recorder_failed, 0);
    assert_eq!(metrics.recorder_persisted, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_mark_trace_failed() {
    let h = recorder(recorder_config(100));
    h.store.fail_next_persists(4);

    h.recorder.record(trace("dec-1")).await;
    h.recorder.flush_now().await;

    let stored = h.store.record("dec-1").unwrap();
    assert_eq!(stored.status, RecordStatus::Failed);
    assert!(stored.error.unwrap().contains("injected"));
    assert_eq!(h.metrics.snapshot().recorder_failed, 1);
    assert_eq!(h.recorder.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn retry_delays_double() {
    let h = recorder(recorder_config(100));
    h.store.fail_next_persists(3);

    let started = Instant::now();
    h.recorder.record(trace("dec-1")).await;
    h.recorder.flush_now().await;

    // 100 + 200 + 400 ms of backoff before the fourth attempt.
    assert_eq!(started.elapsed(), Duration::from_millis(700));
}

#[tokio::test(start_paused = true)]
async fn full_queue_blocks_until_flush_frees_capacity() {
    let h = recorder(recorder_config(1));
    h.store.fail_next_persists(1);

    h.recorder.record(trace("dec-1")).await;

    let started = Instant::now();
    h.recorder.record(trace("dec-2")).await;
    let waited = started.elapsed();

    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_millis(500));
    let metrics = h.metrics.snapshot();
    assert_eq!(metrics.backpressure_waits, 1);
    assert_eq!(metrics.backpressure_timeouts, 0);

    h.recorder.flush_now().await;
    assert_eq!(h.store.records().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn backpressure_timeout_enqueues_anyway() {
    let h = recorder(recorder_config(1));
    h.store.fail_next_persists(4);

    h.recorder.record(trace("dec-1")).await;

    let started = Instant::now();
    h.recorder.record(trace("dec-2")).await;
    assert_eq!(started.elapsed(), Duration::from_millis(500));
    assert_eq!(h.metrics.snapshot().backpressure_timeouts, 1);

    h.recorder.flush_now().await;
    assert_eq!(h.store.record("dec-1").unwrap().status, RecordStatus::Failed);
    assert_eq!(h.store.record("dec-2").unwrap().status, RecordStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn persisted_decisions_reach_sink_and_insights() {
    let h = recorder(recorder_config(100));
    let mut events = h.events.subscribe_global();

    h.recorder.record(trace("dec-1")).await;
    h.recorder.flush_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let envelope = events.try_recv().unwrap();
    assert_eq!(envelope.event.event_type(), "DECISION_RECORDED");

    let insights = h.store.insights();
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].decision_id, "dec-1");
    assert_eq!(insights[0].feature_hash, feature_hash(&[0.1, 0.2, 0.3]));
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_queue() {
    let h = recorder(recorder_config(100));
    let timer = h.recorder.spawn_periodic_flush();

    for i in 0..5 {
        h.recorder.record(trace(&format!("dec-{i}"))).await;
    }
    h.recorder.shutdown().await;
    timer.await.unwrap();

    assert_eq!(h.recorder.queue_len(), 0);
    assert!(!h.recorder.is_flushing());
    assert_eq!(h.store.records().len(), 5);
}
