mod common;

use std::sync::Arc;

use common::event;
use danci_amas::amas::config::AMASConfig;
use danci_amas::amas::online::ProcessContext;
use danci_amas::amas::persistence::AmasRepository;
use danci_amas::amas::types::{DecisionSource, PipelineStage, UserState};
use danci_amas::db::memory::{MemoryDecisionStore, MemoryRepository, RecordStatus};
use danci_amas::AmasRuntime;

const BASE_TS: i64 = 1_700_000_000_000;
const HOUR_MS: i64 = 3_600_000;

struct Harness {
    runtime: AmasRuntime,
    repository: Arc<MemoryRepository>,
    store: Arc<MemoryDecisionStore>,
}

fn harness(config: AMASConfig) -> Harness {
    let repository = Arc::new(MemoryRepository::new());
    let store = Arc::new(MemoryDecisionStore::new());
    let runtime = AmasRuntime::new(config, repository.clone(), store.clone(), None).unwrap();
    Harness {
        runtime,
        repository,
        store,
    }
}

#[tokio::test]
async fn decisions_are_recorded_with_pipeline_stages() {
    let h = harness(AMASConfig::default());
    let mut events = h.runtime.events().subscribe_global();

    let mut ids = Vec::new();
    for i in 0..3 {
        let result = h
            .runtime
            .process_event("u1", event(true, 2500, BASE_TS + i * 1000), None, ProcessContext::default())
            .await;
        ids.push(result.decision.decision_id);
    }
    h.runtime.recorder().flush_now().await;

    let records = h.store.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == RecordStatus::Success));
    for id in &ids {
        let stages: Vec<PipelineStage> = h.store.stages(id).iter().map(|s| s.stage).collect();
        assert_eq!(
            stages,
            vec![
                PipelineStage::Perception,
                PipelineStage::Modeling,
                PipelineStage::Decision,
                PipelineStage::Evaluation,
            ]
        );
    }

    let first = events.recv().await.unwrap();
    assert_eq!(first.event.user_id(), Some("u1"));
    assert_eq!(h.runtime.metrics().snapshot().decisions, 3);
}

#[tokio::test]
async fn delayed_rewards_update_and_persist_the_model() {
    let h = harness(AMASConfig::default());

    for i in 0..4 {
        h.runtime
            .process_event("u1", event(true, 2000, BASE_TS + i), None, ProcessContext::default())
            .await;
    }
    assert_eq!(h.runtime.aggregator().pending_for_user("u1"), 4);

    let immediate = h.runtime.offline().process_once(BASE_TS + 10).await;
    assert_eq!(immediate.applied, 1);
    assert_eq!(h.runtime.policy().snapshot("u1").unwrap().update_count, 1);

    let nothing = h.runtime.offline().process_once(BASE_TS + HOUR_MS - 1).await;
    assert_eq!(nothing.users, 0);

    // The 1h and 24h partials mature together and are summed into one update.
    let delayed = h.runtime.offline().process_once(BASE_TS + 25 * HOUR_MS).await;
    assert_eq!(delayed.applied, 1);
    assert_eq!(h.runtime.aggregator().pending_count(), 0);

    let persisted = h.repository.load_model("u1").await.unwrap().unwrap();
    assert_eq!(persisted.update_count, 2);
    assert_eq!(h.runtime.metrics().snapshot().rewards_applied, 2);
}

#[tokio::test]
async fn state_survives_session_eviction() {
    let h = harness(AMASConfig::default());

    let first = h
        .runtime
        .process_event("u1", event(false, 6000, BASE_TS), None, ProcessContext::default())
        .await;
    assert_eq!(h.runtime.online().cleanup_inactive(-1), 1);

    let saved: UserState = h.repository.load_state("u1").await.unwrap().unwrap();
    assert_eq!(saved, first.updated_state);

    let second = h
        .runtime
        .process_event("u1", event(true, 2000, BASE_TS + 1000), None, ProcessContext::default())
        .await;
    assert_eq!(second.decision.source, DecisionSource::Online);
    assert_eq!(h.repository.load_state("u1").await.unwrap().unwrap().ts, BASE_TS + 1000);
}

#[tokio::test]
async fn fatigue_recovers_after_a_break_across_eviction() {
    let h = harness(AMASConfig::default());

    let mut last_ts = BASE_TS;
    let mut tired = 0.0;
    for i in 0..6 {
        last_ts = BASE_TS + i * 10_000;
        let result = h
            .runtime
            .process_event("u1", event(false, 6000, last_ts), None, ProcessContext::default())
            .await;
        tired = result.updated_state.fatigue;
    }
    assert!(tired > 0.5, "fatigue only reached {tired}");
    assert_eq!(h.runtime.online().cleanup_inactive(-1), 1);

    let rested = h
        .runtime
        .process_event("u1", event(true, 2000, last_ts + 2 * HOUR_MS), None, ProcessContext::default())
        .await;
    assert!(
        rested.updated_state.fatigue < 0.05,
        "fatigue {} carried over a two hour break",
        rested.updated_state.fatigue
    );
}

#[tokio::test]
async fn pending_rewards_and_optimizer_history_survive_a_restart() {
    let mut config = AMASConfig::default();
    config.optimizer.enabled = true;
    config.optimizer.min_rewards_per_evaluation = 1;

    let repository = Arc::new(MemoryRepository::new());
    let first = AmasRuntime::new(
        config.clone(),
        repository.clone(),
        Arc::new(MemoryDecisionStore::new()),
        None,
    )
    .unwrap();
    for i in 0..3 {
        first
            .process_event("u1", event(true, 2000, BASE_TS + i), None, ProcessContext::default())
            .await;
    }
    first.offline().process_once(BASE_TS + 10).await;
    let pending = first.aggregator().get_state();
    let history = first.offline().optimizer_state().unwrap();
    assert_eq!(first.aggregator().pending_for_user("u1"), 3);
    assert_eq!(history.observations.len(), 1);
    first.shutdown().await;

    let second = AmasRuntime::new(
        config,
        repository.clone(),
        Arc::new(MemoryDecisionStore::new()),
        None,
    )
    .unwrap();
    assert_eq!(second.aggregator().pending_count(), 0);
    second.restore_snapshots().await.unwrap();

    assert_eq!(second.aggregator().get_state(), pending);
    assert_eq!(second.offline().optimizer_state().unwrap(), history);

    let delayed = second.offline().process_once(BASE_TS + 25 * HOUR_MS).await;
    assert_eq!(delayed.users, 1);
    assert_eq!(second.aggregator().pending_count(), 0);
}

#[tokio::test]
async fn users_are_isolated() {
    let h = Arc::new(harness(AMASConfig::default()));

    let tasks: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|user| {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                for i in 0..5 {
                    h.runtime
                        .process_event(user, event(i % 2 == 0, 2500, BASE_TS + i), None, ProcessContext::default())
                        .await;
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(h.runtime.online().session_count(), 4);
    for user in ["a", "b", "c", "d"] {
        assert_eq!(h.runtime.online().recent_events(user).await.len(), 5);
        assert_eq!(h.runtime.aggregator().pending_for_user(user), 5);
    }
}
