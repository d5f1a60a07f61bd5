use crate::amas::config::PerceptionConfig;
use crate::amas::types::{FeatureVector, RawEvent};

pub const EVENT_FEATURE_LABELS: [&str; 8] = [
    "z_rt",
    "z_pause",
    "z_switch",
    "z_focus_loss",
    "z_dwell",
    "retry_ratio",
    "correct",
    "hint",
];

const Z_LIMIT: f64 = 3.0;

fn bounded(value: f64, limit: f64) -> f64 {
    if value.is_finite() {
        value.clamp(-limit, limit)
    } else {
        0.0
    }
}

/// Stateless mapping from one interaction to a fixed-length feature vector.
#[derive(Debug, Clone, Default)]
pub struct FeatureBuilder {
    perception: PerceptionConfig,
}

impl FeatureBuilder {
    pub fn new(perception: PerceptionConfig) -> Self {
        Self { perception }
    }

    pub fn dimension(&self) -> usize {
        EVENT_FEATURE_LABELS.len()
    }

    pub fn build(&self, event: &RawEvent) -> FeatureVector {
        let p = &self.perception;
        let response_time = event.response_time.clamp(0, p.max_response_time) as f64;
        let focus_loss = event.focus_loss_duration.unwrap_or(0).max(0) as f64;
        let dwell = event.dwell_time.map(|d| d.max(0) as f64).unwrap_or(p.dwell.mean);
        let retry_ratio = if p.max_retry_count > 0 {
            (event.retry_count.max(0) as f64 / p.max_retry_count as f64).min(1.0)
        } else {
            0.0
        };

        let values = vec![
            bounded(p.rt.z_score(response_time), Z_LIMIT),
            bounded(p.pause.z_score(event.pause_count.max(0) as f64), Z_LIMIT),
            bounded(p.switches.z_score(event.switch_count.max(0) as f64), Z_LIMIT),
            bounded(p.focus_loss.z_score(focus_loss), Z_LIMIT),
            bounded(p.dwell.z_score(dwell), Z_LIMIT),
            retry_ratio,
            if event.is_correct { 1.0 } else { 0.0 },
            if event.hint_used { 1.0 } else { 0.0 },
        ];

        FeatureVector::new(
            values,
            EVENT_FEATURE_LABELS.iter().map(|l| l.to_string()).collect(),
            event.timestamp,
        )
    }
}
