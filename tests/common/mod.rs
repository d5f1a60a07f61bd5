#![allow(dead_code)]

use std::sync::Arc;

use danci_amas::amas::config::RecorderConfig;
use danci_amas::amas::metrics::AmasMetrics;
use danci_amas::amas::types::{Action, DecisionTrace, PipelineStage, PipelineStageTrace, RawEvent};
use danci_amas::core::EventBus;
use danci_amas::db::memory::MemoryDecisionStore;
use danci_amas::services::decision_recorder::{DecisionEventSink, DecisionRecorder};

pub fn event(correct: bool, response_time: i64, timestamp: i64) -> RawEvent {
    RawEvent {
        is_correct: correct,
        response_time,
        timestamp,
        ..RawEvent::default()
    }
}

pub fn trace(decision_id: &str) -> DecisionTrace {
    let mut trace = DecisionTrace::new(decision_id, Action::default(), 1_700_000_000_000);
    trace.user_id = Some("user-1".to_string());
    trace.confidence = 0.7;
    trace.feature_vector = Some(vec![0.1, 0.2, 0.3]);
    trace.pipeline_stages = vec![
        PipelineStageTrace::completed(PipelineStage::Perception, "feature_builder", trace.timestamp, 0.2),
        PipelineStageTrace::completed(PipelineStage::Decision, "linucb", trace.timestamp, 0.5),
    ];
    trace
}

pub fn recorder_config(queue_capacity: usize) -> RecorderConfig {
    RecorderConfig {
        queue_capacity,
        flush_interval_ms: 50,
        max_batch_size: 50,
        max_retries: 3,
        retry_base_delay_ms: 100,
        backpressure_timeout_ms: 500,
    }
}

pub struct RecorderHarness {
    pub recorder: DecisionRecorder,
    pub store: Arc<MemoryDecisionStore>,
    pub metrics: Arc<AmasMetrics>,
    pub events: Arc<EventBus>,
}

pub fn recorder(config: RecorderConfig) -> RecorderHarness {
    let store = Arc::new(MemoryDecisionStore::new());
    let metrics = Arc::new(AmasMetrics::new());
    let events = Arc::new(EventBus::new());
    let sink: Arc<dyn DecisionEventSink> = events.clone();
    let recorder = DecisionRecorder::new(store.clone(), Some(sink), config, metrics.clone());
    RecorderHarness {
        recorder,
        store,
        metrics,
        events,
    }
}
