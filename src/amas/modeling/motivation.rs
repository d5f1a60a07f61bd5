use crate::amas::config::MotivationParams;
use crate::amas::types::RawEvent;

/// `M_t = clamp(ρ·M_{t-1} + κ(1 + streak bonus) | − λ | − μ, -1, 1)` for a
/// clean success, a failure (wrong or retried) and a quit respectively.
#[derive(Debug, Clone)]
pub struct MotivationTracker {
    params: MotivationParams,
    current_value: f64,
    streak: i32,
}

impl MotivationTracker {
    pub fn new(params: MotivationParams) -> Self {
        Self {
            params,
            current_value: 0.5,
            streak: 0,
        }
    }

    pub fn update(&mut self, event: &RawEvent) -> f64 {
        let p = &self.params;
        if event.is_quit {
            self.current_value = p.rho * self.current_value - p.mu;
            self.streak = 0;
        } else if event.is_correct && event.retry_count == 0 {
            self.streak += 1;
            let streak_bonus = (self.streak as f64 / 10.0).min(0.5) * p.kappa;
            self.current_value = p.rho * self.current_value + p.kappa + streak_bonus;
        } else {
            self.streak = 0;
            self.current_value = p.rho * self.current_value - p.lambda;
        }

        self.current_value = self.current_value.clamp(-1.0, 1.0);
        self.current_value
    }

    pub fn current(&self) -> f64 {
        self.current_value
    }

    pub fn streak(&self) -> i32 {
        self.streak
    }

    pub fn set_value(&mut self, value: f64) {
        if value.is_finite() {
            self.current_value = value.clamp(-1.0, 1.0);
        }
    }
}

impl Default for MotivationTracker {
    fn default() -> Self {
        Self::new(MotivationParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_streak_raises_motivation() {
        let mut tracker = MotivationTracker::default();
        let start = tracker.current();
        for _ in 0..5 {
            tracker.update(&RawEvent::default());
        }
        assert!(tracker.current() > start);
        assert_eq!(tracker.streak(), 5);
    }

    #[test]
    fn retry_counts_as_failure() {
        let mut tracker = MotivationTracker::default();
        let before = tracker.update(&RawEvent::default());
        let value = tracker.update(&RawEvent {
            retry_count: 2,
            ..RawEvent::default()
        });
        assert_eq!(tracker.streak(), 0);
        assert!(value < before);
    }

    #[test]
    fn quit_is_penalized_more_than_failure() {
        let mut failed = MotivationTracker::default();
        let mut quit = MotivationTracker::default();
        failed.update(&RawEvent {
            is_correct: false,
            ..RawEvent::default()
        });
        quit.update(&RawEvent {
            is_quit: true,
            ..RawEvent::default()
        });
        assert!(quit.current() < failed.current());
    }

    #[test]
    fn value_stays_in_range() {
        let mut tracker = MotivationTracker::default();
        for _ in 0..100 {
            tracker.update(&RawEvent {
                is_quit: true,
                ..RawEvent::default()
            });
        }
        assert!(tracker.current() >= -1.0);
    }
}
