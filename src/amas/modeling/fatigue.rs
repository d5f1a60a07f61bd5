use crate::amas::config::FatigueParams;
use crate::amas::types::RawEvent;

const MAX_STEP: f64 = 0.9;
const MAX_RT_INCREASE: f64 = 1.0;

/// Exponential-decay fatigue model.
///
/// Between events fatigue decays by `exp(-k·Δt_min)`; a gap of at least
/// `long_break_threshold` minutes resets it. Each event then moves it toward 1
/// by `Δ·(1 - F)` where `Δ` grows with errors, error streaks and response
/// time above the learner's running baseline.
#[derive(Debug, Clone)]
pub struct FatigueEstimator {
    params: FatigueParams,
    current_value: f64,
    baseline_rt: Option<f64>,
    error_streak: u32,
    last_event_ts: Option<i64>,
}

impl FatigueEstimator {
    pub fn new(params: FatigueParams) -> Self {
        Self {
            params,
            current_value: 0.0,
            baseline_rt: None,
            error_streak: 0,
            last_event_ts: None,
        }
    }

    pub fn update(&mut self, event: &RawEvent) -> f64 {
        if let Some(last) = self.last_event_ts {
            let gap_minutes = (event.timestamp - last).max(0) as f64 / 60_000.0;
            if gap_minutes >= self.params.long_break_threshold {
                self.current_value = 0.0;
                self.error_streak = 0;
            } else {
                self.current_value *= (-self.params.k * gap_minutes).exp();
            }
        }
        self.last_event_ts = Some(event.timestamp);

        if event.is_correct {
            self.error_streak = 0;
        } else {
            self.error_streak = self.error_streak.saturating_add(1);
        }

        let rt = event.response_time.max(0) as f64;
        let rt_increase = match self.baseline_rt {
            Some(baseline) if baseline > 0.0 => ((rt - baseline) / baseline).max(0.0),
            _ => 0.0,
        };
        self.baseline_rt = Some(match self.baseline_rt {
            Some(baseline) => baseline + self.params.baseline_alpha * (rt - baseline),
            None => rt,
        });

        let error_component = if event.is_correct { 0.0 } else { self.params.beta };
        let rt_component = self.params.gamma * rt_increase.min(MAX_RT_INCREASE);
        let streak_component = self.params.delta * (self.error_streak as f64 / 5.0).min(1.0);
        let step = (error_component + rt_component + streak_component).min(MAX_STEP);

        self.current_value = (self.current_value + step * (1.0 - self.current_value)).clamp(0.0, 1.0);
        self.current_value
    }

    pub fn current(&self) -> f64 {
        self.current_value
    }

    pub fn set_value(&mut self, value: f64) {
        if value.is_finite() {
            self.current_value = value.clamp(0.0, 1.0);
        }
    }

    /// Timestamp the next event's decay and break check measure from.
    pub fn set_last_event_ts(&mut self, ts: i64) {
        self.last_event_ts = Some(ts);
    }
}

impl Default for FatigueEstimator {
    fn default() -> Self {
        Self::new(FatigueParams::default())
    }
}
