use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-wide counters shared by the loops, the recorder and the cache layer.
#[derive(Debug, Default)]
pub struct AmasMetrics {
    pub decisions: AtomicU64,
    pub fallback_decisions: AtomicU64,
    pub budget_overruns: AtomicU64,
    pub detection_failures: AtomicU64,
    pub recorder_enqueued: AtomicU64,
    pub recorder_persisted: AtomicU64,
    pub recorder_failed: AtomicU64,
    pub recorder_retries: AtomicU64,
    pub backpressure_waits: AtomicU64,
    pub backpressure_timeouts: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_degradations: AtomicU64,
    pub rewards_applied: AtomicU64,
    pub rewards_filtered: AtomicU64,
    pub rewards_dropped: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub decisions: u64,
    pub fallback_decisions: u64,
    pub budget_overruns: u64,
    pub detection_failures: u64,
    pub recorder_enqueued: u64,
    pub recorder_persisted: u64,
    pub recorder_failed: u64,
    pub recorder_retries: u64,
    pub backpressure_waits: u64,
    pub backpressure_timeouts: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_degradations: u64,
    pub rewards_applied: u64,
    pub rewards_filtered: u64,
    pub rewards_dropped: u64,
}

impl AmasMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            decisions: load(&self.decisions),
            fallback_decisions: load(&self.fallback_decisions),
            budget_overruns: load(&self.budget_overruns),
            detection_failures: load(&self.detection_failures),
            recorder_enqueued: load(&self.recorder_enqueued),
            recorder_persisted: load(&self.recorder_persisted),
            recorder_failed: load(&self.recorder_failed),
            recorder_retries: load(&self.recorder_retries),
            backpressure_waits: load(&self.backpressure_waits),
            backpressure_timeouts: load(&self.backpressure_timeouts),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            cache_degradations: load(&self.cache_degradations),
            rewards_applied: load(&self.rewards_applied),
            rewards_filtered: load(&self.rewards_filtered),
            rewards_dropped: load(&self.rewards_dropped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = AmasMetrics::new();
        AmasMetrics::incr(&metrics.decisions);
        AmasMetrics::incr(&metrics.decisions);
        AmasMetrics::add(&metrics.recorder_persisted, 5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.decisions, 2);
        assert_eq!(snapshot.recorder_persisted, 5);
        assert_eq!(snapshot.backpressure_timeouts, 0);
    }
}
