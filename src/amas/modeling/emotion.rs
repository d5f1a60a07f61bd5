use serde::{Deserialize, Serialize};

use crate::amas::config::EmotionConfig;
use crate::amas::modeling::{response_time_cv, success_rate, DetectionError};
use crate::amas::types::{RawEvent, UserState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionState {
    Frustrated,
    Anxious,
    Bored,
    Tired,
    Engaged,
    Normal,
}

impl EmotionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Frustrated => "frustrated",
            Self::Anxious => "anxious",
            Self::Bored => "bored",
            Self::Tired => "tired",
            Self::Engaged => "engaged",
            Self::Normal => "normal",
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            Self::Frustrated => "Reduce difficulty and show an encouraging hint",
            Self::Anxious => "Slow the pace and shrink the batch",
            Self::Bored => "Slightly increase difficulty or introduce new material",
            Self::Tired => "Suggest a short break",
            Self::Engaged => "Keep the current settings",
            Self::Normal => "No adjustment needed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionSignals {
    pub consecutive_wrong: usize,
    pub response_time_cv: f64,
    pub skip_count: usize,
    pub dwell_ratio: Option<f64>,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionResult {
    pub state: EmotionState,
    pub score: f64,
    pub signals: Option<EmotionSignals>,
    pub recommendation: String,
}

impl EmotionResult {
    fn neutral() -> Self {
        Self {
            state: EmotionState::Normal,
            score: 0.5,
            signals: None,
            recommendation: EmotionState::Normal.recommendation().to_string(),
        }
    }

    fn classified(state: EmotionState, score: f64, signals: EmotionSignals) -> Self {
        Self {
            state,
            score: score.clamp(0.0, 1.0),
            signals: Some(signals),
            recommendation: state.recommendation().to_string(),
        }
    }
}

/// Rule-based classifier over behavioral signals of the recent window.
#[derive(Debug, Clone, Default)]
pub struct EmotionDetector {
    config: EmotionConfig,
}

impl EmotionDetector {
    pub fn new(config: EmotionConfig) -> Self {
        Self { config }
    }

    pub fn signals(&self, events: &[RawEvent]) -> EmotionSignals {
        let consecutive_wrong = events.iter().rev().take_while(|e| !e.is_correct).count();
        let skip_count = events
            .iter()
            .filter(|e| !e.is_correct && e.response_time < self.config.skip_threshold_ms)
            .count();

        let dwells: Vec<f64> = events
            .iter()
            .filter_map(|e| e.dwell_time.map(|d| d.max(0) as f64))
            .collect();
        let mean_rt = if events.is_empty() {
            0.0
        } else {
            events.iter().map(|e| e.response_time.max(0) as f64).sum::<f64>() / events.len() as f64
        };
        let dwell_ratio = if dwells.is_empty() || mean_rt <= 0.0 {
            None
        } else {
            Some(dwells.iter().sum::<f64>() / dwells.len() as f64 / mean_rt)
        };

        EmotionSignals {
            consecutive_wrong,
            response_time_cv: response_time_cv(events).unwrap_or(0.0),
            skip_count,
            dwell_ratio,
            error_rate: if events.is_empty() {
                0.0
            } else {
                1.0 - success_rate(events)
            },
        }
    }

    pub fn detect(
        &self,
        state: &UserState,
        events: &[RawEvent],
    ) -> Result<EmotionResult, DetectionError> {
        if events.len() < self.config.min_events {
            return Ok(EmotionResult::neutral());
        }
        if !state.fatigue.is_finite() {
            return Err(DetectionError::NonFinite("fatigue"));
        }
        if !state.attention.is_finite() {
            return Err(DetectionError::NonFinite("attention"));
        }

        let c = &self.config;
        let s = self.signals(events);
        let accuracy = 1.0 - s.error_rate;

        let result = if s.consecutive_wrong >= c.frustration_streak {
            let score = 0.5 + 0.1 * s.consecutive_wrong as f64;
            EmotionResult::classified(EmotionState::Frustrated, score, s)
        } else if state.fatigue >= c.tired_fatigue {
            EmotionResult::classified(EmotionState::Tired, state.fatigue, s)
        } else if s.skip_count >= c.boredom_skip_count
            || (s.error_rate < 0.1 && s.dwell_ratio.is_some_and(|r| r < c.boredom_dwell_ratio))
        {
            let score = 0.6 + 0.1 * s.skip_count as f64;
            EmotionResult::classified(EmotionState::Bored, score, s)
        } else if s.response_time_cv > c.anxiety_rt_cv && s.error_rate > c.anxiety_error_rate {
            let score = (s.response_time_cv + s.error_rate) / 2.0;
            EmotionResult::classified(EmotionState::Anxious, score, s)
        } else if accuracy >= c.engaged_accuracy && state.attention >= c.engaged_attention {
            let score = (accuracy + state.attention) / 2.0;
            EmotionResult::classified(EmotionState::Engaged, score, s)
        } else {
            EmotionResult::classified(EmotionState::Normal, 0.5, s)
        };

        Ok(result)
    }
}
