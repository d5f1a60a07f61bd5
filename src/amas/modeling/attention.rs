use crate::amas::config::AttentionWeights;
use crate::amas::types::{FeatureVector, RawEvent};

const RT_EWMA_ALPHA: f64 = 0.2;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Smoothed attention estimate.
///
/// `A_raw = sigmoid(bias - w·f)` over the normalized event signals and the
/// monitor's own response-time variability, then
/// `A_t = (1 - s)·A_{t-1} + s·A_raw`.
#[derive(Debug, Clone)]
pub struct AttentionMonitor {
    weights: AttentionWeights,
    smoothing: f64,
    current_value: f64,
    rt_mean: Option<f64>,
    rt_var: f64,
}

impl AttentionMonitor {
    pub fn new(weights: AttentionWeights, smoothing: f64) -> Self {
        Self {
            weights,
            smoothing: smoothing.clamp(0.0, 1.0),
            current_value: 0.7,
            rt_mean: None,
            rt_var: 0.0,
        }
    }

    fn observe_response_time(&mut self, rt: f64) -> f64 {
        match self.rt_mean {
            None => {
                self.rt_mean = Some(rt);
                0.0
            }
            Some(mean) => {
                let diff = rt - mean;
                let next_mean = mean + RT_EWMA_ALPHA * diff;
                self.rt_var = (1.0 - RT_EWMA_ALPHA) * (self.rt_var + RT_EWMA_ALPHA * diff * diff);
                self.rt_mean = Some(next_mean);
                if next_mean > 0.0 {
                    (self.rt_var.sqrt() / next_mean).min(2.0)
                } else {
                    0.0
                }
            }
        }
    }

    pub fn update(&mut self, event: &RawEvent, features: &FeatureVector) -> f64 {
        let cv = self.observe_response_time(event.response_time.max(0) as f64);
        let w = &self.weights;
        let signal = |label: &str| features.get(label).unwrap_or(0.0);

        let load = w.rt_mean * signal("z_rt")
            + w.rt_cv * cv
            + w.pause * signal("z_pause")
            + w.switch * signal("z_switch")
            + w.focus_loss * signal("z_focus_loss")
            + w.dwell * signal("z_dwell").abs();
        let raw = sigmoid(w.bias - load);

        if raw.is_finite() {
            self.current_value = ((1.0 - self.smoothing) * self.current_value
                + self.smoothing * raw)
                .clamp(0.0, 1.0);
        }
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
}

impl Default for AttentionMonitor {
    fn default() -> Self {
        Self::new(AttentionWeights::default(), 0.3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amas::features::FeatureBuilder;

    #[test]
    fn distractions_lower_attention() {
        let builder = FeatureBuilder::default();
        let mut focused = AttentionMonitor::default();
        let mut distracted = AttentionMonitor::default();

        for i in 0..10 {
            let calm = RawEvent {
                response_time: 2500,
                timestamp: i,
                ..RawEvent::default()
            };
            let noisy = RawEvent {
                response_time: if i % 2 == 0 { 1500 } else { 9000 },
                pause_count: 6,
                switch_count: 4,
                focus_loss_duration: Some(15000),
                timestamp: i,
                ..RawEvent::default()
            };
            focused.update(&calm, &builder.build(&calm));
            distracted.update(&noisy, &builder.build(&noisy));
        }

        assert!(focused.current() > distracted.current());
        assert!((0.0..=1.0).contains(&distracted.current()));
    }

    #[test]
    fn identical_history_gives_identical_estimate() {
        let builder = FeatureBuilder::default();
        let mut a = AttentionMonitor::default();
        let mut b = AttentionMonitor::default();
        let event = RawEvent {
            response_time: 4200,
            pause_count: 1,
            timestamp: 5,
            ..RawEvent::default()
        };
        let features = builder.build(&event);
        assert_eq!(a.update(&event, &features), b.update(&event, &features));
    }
}
