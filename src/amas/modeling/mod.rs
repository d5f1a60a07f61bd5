pub mod attention;
pub mod cognitive;
pub mod emotion;
pub mod fatigue;
pub mod flow;
pub mod motivation;

pub use attention::AttentionMonitor;
pub use cognitive::CognitiveProfiler;
pub use emotion::{EmotionDetector, EmotionResult, EmotionState};
pub use fatigue::FatigueEstimator;
pub use flow::{FlowDetector, FlowResult, FlowState};
pub use motivation::MotivationTracker;

use thiserror::Error;

use crate::amas::types::RawEvent;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("non-finite {0} in detector input")]
    NonFinite(&'static str),
}

/// State confidence as a function of how many interactions have been seen:
/// `[0.3, 0.5)` below 10, `[0.5, 0.8)` below 50, then `[0.8, 0.95]`.
pub fn interaction_confidence(interactions: u64) -> f64 {
    if interactions < 10 {
        0.3 + 0.2 * interactions as f64 / 10.0
    } else if interactions < 50 {
        0.5 + 0.3 * (interactions - 10) as f64 / 40.0
    } else {
        let growth = 1.0 - (-((interactions - 50) as f64) / 100.0).exp();
        (0.8 + 0.15 * growth).min(0.95)
    }
}

pub(crate) fn success_rate(events: &[RawEvent]) -> f64 {
    if events.is_empty() {
        return 0.0;
    }
    events.iter().filter(|e| e.is_correct).count() as f64 / events.len() as f64
}

/// Coefficient of variation of response times; `None` when undefined.
pub(crate) fn response_time_cv(events: &[RawEvent]) -> Option<f64> {
    if events.is_empty() {
        return None;
    }
    let n = events.len() as f64;
    let times: Vec<f64> = events.iter().map(|e| e.response_time.max(0) as f64).collect();
    let mean = times.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return None;
    }
    let variance = times.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt() / mean)
}
