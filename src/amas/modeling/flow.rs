use serde::{Deserialize, Serialize};

use crate::amas::config::FlowConfig;
use crate::amas::modeling::{response_time_cv, success_rate, DetectionError};
use crate::amas::types::{RawEvent, UserState};

pub const NEUTRAL_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowState {
    Flow,
    Anxiety,
    Boredom,
    Normal,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flow => "flow",
            Self::Anxiety => "anxiety",
            Self::Boredom => "boredom",
            Self::Normal => "normal",
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            Self::Flow => "Keep difficulty and current pace",
            Self::Anxiety => "Reduce difficulty and offer more hints",
            Self::Boredom => "Slightly increase difficulty or introduce new words",
            Self::Normal => "Fine-tune difficulty toward the target success band",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResult {
    pub state: FlowState,
    pub score: f64,
    pub success_rate: f64,
    pub stability: f64,
    pub state_factor: f64,
    pub event_count: usize,
    pub recommendation: String,
}

impl FlowResult {
    fn insufficient(event_count: usize) -> Self {
        Self {
            state: FlowState::Normal,
            score: NEUTRAL_SCORE,
            success_rate: 0.0,
            stability: NEUTRAL_SCORE,
            state_factor: NEUTRAL_SCORE,
            event_count,
            recommendation: "Insufficient data, keep current settings".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlowDetector {
    config: FlowConfig,
}

impl FlowDetector {
    pub fn new(config: FlowConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Peaks at 1.0 in the middle of the target band, 0.5 at its edges and
    /// falls off as a gaussian outside it.
    pub fn success_factor(&self, rate: f64) -> f64 {
        let low = self.config.target_low;
        let high = self.config.target_high;
        let mid = (low + high) / 2.0;
        let half_width = (high - low) / 2.0;

        if (low..=high).contains(&rate) {
            let dist = (rate - mid).abs() / half_width;
            1.0 - 0.5 * dist * dist
        } else {
            let excess = if rate < low { low - rate } else { rate - high };
            0.5 * (-(excess / self.config.outside_band_width).powi(2)).exp()
        }
    }

    pub fn stability_factor(&self, events: &[RawEvent]) -> f64 {
        match response_time_cv(events) {
            Some(cv) => (1.0 - cv).max(0.0),
            None => NEUTRAL_SCORE,
        }
    }

    pub fn state_factor(&self, state: &UserState) -> f64 {
        let motivation = (state.motivation.clamp(-1.0, 1.0) + 1.0) / 2.0;
        (self.config.attention_weight * state.attention.clamp(0.0, 1.0)
            + self.config.motivation_weight * motivation)
            .clamp(0.0, 1.0)
    }

    /// Classifies the most recent `window_size` events.
    pub fn detect(
        &self,
        state: &UserState,
        events: &[RawEvent],
    ) -> Result<FlowResult, DetectionError> {
        let start = events.len().saturating_sub(self.config.window_size);
        self.classify_window(state, &events[start..])
    }

    /// One classification per consecutive window of `window_size` events. A
    /// trailing window is kept when it still holds `min_events` events.
    pub fn detect_series(
        &self,
        state: &UserState,
        events: &[RawEvent],
    ) -> Result<Vec<FlowResult>, DetectionError> {
        events
            .chunks(self.config.window_size.max(1))
            .filter(|window| window.len() >= self.config.min_events)
            .map(|window| self.classify_window(state, window))
            .collect()
    }

    fn classify_window(
        &self,
        state: &UserState,
        events: &[RawEvent],
    ) -> Result<FlowResult, DetectionError> {
        if events.len() < self.config.min_events {
            return Ok(FlowResult::insufficient(events.len()));
        }
        if !state.attention.is_finite() {
            return Err(DetectionError::NonFinite("attention"));
        }
        if !state.motivation.is_finite() {
            return Err(DetectionError::NonFinite("motivation"));
        }

        let rate = success_rate(events);
        let stability = self.stability_factor(events);
        let state_factor = self.state_factor(state);
        let score = (self.success_factor(rate) * stability * state_factor).clamp(0.0, 1.0);

        let flow_state = if rate < self.config.target_low {
            FlowState::Anxiety
        } else if rate > self.config.target_high {
            FlowState::Boredom
        } else if score > self.config.flow_threshold {
            FlowState::Flow
        } else {
            FlowState::Normal
        };

        Ok(FlowResult {
            state: flow_state,
            score,
            success_rate: rate,
            stability,
            state_factor,
            event_count: events.len(),
            recommendation: flow_state.recommendation().to_string(),
        })
    }
}
