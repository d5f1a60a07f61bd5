use crate::amas::config::{PerceptionConfig, RewardConfig};
use crate::amas::types::{RawEvent, Reward, UserState};

/// Scores the outcome of a single interaction in `[-1, 1]`.
#[derive(Debug, Clone, Default)]
pub struct ImmediateRewardEvaluator {
    weights: RewardConfig,
    perception: PerceptionConfig,
}

impl ImmediateRewardEvaluator {
    pub fn new(weights: RewardConfig, perception: PerceptionConfig) -> Self {
        Self {
            weights,
            perception,
        }
    }

    pub fn evaluate(&self, event: &RawEvent, state: &UserState) -> Reward {
        let w = &self.weights;
        let accuracy_score = if event.is_correct { 1.0 } else { 0.0 };
        let max_rt = self.perception.max_response_time.max(1) as f64;
        let speed_score = 1.0 - (event.response_time.max(0) as f64 / max_rt).min(1.0);
        let stability_score = state.cognitive.stability.clamp(0.0, 1.0);
        let retention_score = state.cognitive.mem.clamp(0.0, 1.0);

        let mut value = w.accuracy_weight * accuracy_score
            + w.speed_weight * speed_score
            + w.stability_weight * stability_score
            + w.retention_weight * retention_score;
        value = value * 2.0 - 1.0;
        if event.hint_used {
            value -= w.hint_penalty;
        }
        let value = if value.is_finite() {
            value.clamp(-1.0, 1.0)
        } else {
            0.0
        };

        let reason = if event.is_correct {
            if event.hint_used {
                "correct with hint"
            } else if speed_score > 0.7 {
                "correct and fast"
            } else {
                "correct"
            }
        } else if event.hint_used {
            "incorrect after hint"
        } else {
            "incorrect"
        };

        Reward::new(value, reason, event.timestamp)
    }
}
