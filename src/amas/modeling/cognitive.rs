use std::collections::VecDeque;

use crate::amas::config::CognitiveParams;
use crate::amas::types::{CognitiveProfile, RawEvent};

#[derive(Debug, Clone)]
pub struct CognitiveProfiler {
    params: CognitiveParams,
    profile: CognitiveProfile,
    accuracy_history: VecDeque<f64>,
}

impl CognitiveProfiler {
    pub fn new(params: CognitiveParams) -> Self {
        let window = params.stability_window;
        Self {
            params,
            profile: CognitiveProfile::default(),
            accuracy_history: VecDeque::with_capacity(window),
        }
    }

    pub fn update(&mut self, event: &RawEvent, recent_error_rate: f64) -> CognitiveProfile {
        let alpha = self.params.memory_alpha;
        let accuracy = if event.is_correct { 1.0 } else { 0.0 };
        self.profile.mem = alpha * accuracy + (1.0 - alpha) * self.profile.mem;

        let rt = event.response_time.max(0) as f64;
        let normalized_speed = 1.0 - (rt / self.params.speed_baseline_ms / 3.0).min(1.0);
        self.profile.speed = alpha * normalized_speed + (1.0 - alpha) * self.profile.speed;

        self.accuracy_history.push_back(accuracy);
        while self.accuracy_history.len() > self.params.stability_window {
            self.accuracy_history.pop_front();
        }

        let consistency = if self.accuracy_history.len() >= 3 {
            1.0 - (variance(&self.accuracy_history) * 4.0).min(1.0)
        } else {
            0.5
        };
        let error_rate = if recent_error_rate.is_finite() {
            recent_error_rate.clamp(0.0, 1.0)
        } else {
            0.5
        };
        let stability = 0.5 * (1.0 - error_rate) + 0.5 * consistency;
        self.profile.stability = alpha * stability + (1.0 - alpha) * self.profile.stability;

        self.profile.mem = self.profile.mem.clamp(0.0, 1.0);
        self.profile.speed = self.profile.speed.clamp(0.0, 1.0);
        self.profile.stability = self.profile.stability.clamp(0.0, 1.0);

        self.profile.clone()
    }

    pub fn current(&self) -> &CognitiveProfile {
        &self.profile
    }

    pub fn set_profile(&mut self, profile: &CognitiveProfile) {
        self.profile = CognitiveProfile {
            mem: profile.mem.clamp(0.0, 1.0),
            speed: profile.speed.clamp(0.0, 1.0),
            stability: profile.stability.clamp(0.0, 1.0),
        };
    }
}

impl Default for CognitiveProfiler {
    fn default() -> Self {
        Self::new(CognitiveParams::default())
    }
}

fn variance(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_accurate_learner_profile_improves() {
        let mut profiler = CognitiveProfiler::default();
        for _ in 0..30 {
            profiler.update(
                &RawEvent {
                    response_time: 1200,
                    ..RawEvent::default()
                },
                0.0,
            );
        }
        let profile = profiler.current();
        assert!(profile.mem > 0.9);
        assert!(profile.speed > 0.6);
        assert!(profile.stability > 0.8);
    }

    #[test]
    fn erratic_answers_lower_stability() {
        let mut steady = CognitiveProfiler::default();
        let mut erratic = CognitiveProfiler::default();
        for i in 0..20 {
            steady.update(&RawEvent::default(), 0.1);
            erratic.update(
                &RawEvent {
                    is_correct: i % 2 == 0,
                    ..RawEvent::default()
                },
                0.5,
            );
        }
        assert!(steady.current().stability > erratic.current().stability);
    }

    #[test]
    fn nan_error_rate_is_tolerated() {
        let mut profiler = CognitiveProfiler::default();
        let profile = profiler.update(&RawEvent::default(), f64::NAN);
        assert!(profile.stability.is_finite());
    }
}
