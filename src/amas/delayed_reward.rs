use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("reward schedule is empty")]
    Empty,
    #[error("schedule entry {label} has invalid weight {weight}")]
    InvalidWeight { label: String, weight: f64 },
    #[error("duplicate schedule delay {0}s")]
    DuplicateDelay(u64),
    #[error("schedule weights sum to {0}, expected 1")]
    WeightSum(f64),
    #[error("reward value must be finite, got {0}")]
    NonFiniteReward(f64),
    #[error("unsupported aggregator snapshot version {0}")]
    SnapshotVersion(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardScheduleEntry {
    pub delay_sec: u64,
    pub weight: f64,
    pub label: String,
}

impl RewardScheduleEntry {
    pub fn new(delay_sec: u64, weight: f64, label: impl Into<String>) -> Self {
        Self {
            delay_sec,
            weight,
            label: label.into(),
        }
    }
}

pub fn validate_schedule(schedule: &[RewardScheduleEntry]) -> Result<(), ScheduleError> {
    if schedule.is_empty() {
        return Err(ScheduleError::Empty);
    }
    let mut delays = HashSet::with_capacity(schedule.len());
    let mut total = 0.0;
    for entry in schedule {
        if !entry.weight.is_finite() || entry.weight < 0.0 {
            return Err(ScheduleError::InvalidWeight {
                label: entry.label.clone(),
                weight: entry.weight,
            });
        }
        if !delays.insert(entry.delay_sec) {
            return Err(ScheduleError::DuplicateDelay(entry.delay_sec));
        }
        total += entry.weight;
    }
    if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(ScheduleError::WeightSum(total));
    }
    Ok(())
}

/// Gate applied by the offline loop before a matured reward reaches the policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "threshold", rename_all = "camelCase")]
pub enum QualityFilter {
    #[default]
    None,
    /// Skip users whose current fatigue is above the threshold.
    FatigueThreshold(f64),
    /// Skip rewards whose magnitude is below the threshold.
    EvaluationThreshold(f64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardContext {
    pub feature_vector: Option<Vec<f64>>,
    pub action_index: Option<usize>,
    pub decision_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardBucket {
    pub due_ms: i64,
    pub amount: f64,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReward {
    pub id: String,
    pub user_id: String,
    pub raw_reward: f64,
    pub created_at: i64,
    pub buckets: Vec<RewardBucket>,
    pub context: Option<RewardContext>,
    #[serde(default)]
    pub attempts: u32,
}

impl PendingReward {
    fn has_matured(&self, now_ms: i64) -> bool {
        self.buckets.iter().any(|b| !b.delivered && b.due_ms <= now_ms)
    }

    fn is_exhausted(&self) -> bool {
        self.buckets.iter().all(|b| b.delivered)
    }
}

/// Per-user sum of every bucket that matured in one drain.
#[derive(Debug, Clone, PartialEq)]
pub struct MaturedReward {
    pub user_id: String,
    pub total: f64,
    pub context: Option<RewardContext>,
    pub attempts: u32,
    pub contributions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorSnapshot {
    pub version: u32,
    pub pending: Vec<PendingReward>,
}

/// Splits each raw reward into weighted partials delivered at the schedule's
/// delays.
pub struct DelayedRewardAggregator {
    schedule: Vec<RewardScheduleEntry>,
    pending: Mutex<Vec<PendingReward>>,
}

impl DelayedRewardAggregator {
    pub fn new(schedule: Vec<RewardScheduleEntry>) -> Result<Self, ScheduleError> {
        validate_schedule(&schedule)?;
        Ok(Self {
            schedule,
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn schedule(&self) -> &[RewardScheduleEntry] {
        &self.schedule
    }

    /// Returns the id of the pending entry.
    pub fn add_reward(
        &self,
        user_id: &str,
        raw_reward: f64,
        context: Option<RewardContext>,
        now_ms: i64,
    ) -> Result<String, ScheduleError> {
        if !raw_reward.is_finite() {
            return Err(ScheduleError::NonFiniteReward(raw_reward));
        }
        let buckets = self
            .schedule
            .iter()
            .map(|entry| RewardBucket {
                due_ms: now_ms.saturating_add((entry.delay_sec as i64).saturating_mul(1000)),
                amount: raw_reward * entry.weight,
                delivered: false,
            })
            .collect();
        Ok(self.push(user_id, raw_reward, buckets, context, 0, now_ms))
    }

    /// Puts a reward that failed to apply back as a single immediate partial.
    pub fn requeue(&self, matured: &MaturedReward, now_ms: i64) -> String {
        let bucket = RewardBucket {
            due_ms: now_ms,
            amount: matured.total,
            delivered: false,
        };
        self.push(
            &matured.user_id,
            matured.total,
            vec![bucket],
            matured.context.clone(),
            matured.attempts + 1,
            now_ms,
        )
    }

    fn push(
        &self,
        user_id: &str,
        raw_reward: f64,
        buckets: Vec<RewardBucket>,
        context: Option<RewardContext>,
        attempts: u32,
        now_ms: i64,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.pending.lock().push(PendingReward {
            id: id.clone(),
            user_id: user_id.to_string(),
            raw_reward,
            created_at: now_ms,
            buckets,
            context,
            attempts,
        });
        id
    }

    /// Collects matured partials for at most `max_users` users, ordered by
    /// user id. Users beyond the limit keep their partials for the next call.
    pub fn drain_matured(&self, now_ms: i64, max_users: usize) -> Vec<MaturedReward> {
        let mut pending = self.pending.lock();

        let mut users: Vec<&str> = pending
            .iter()
            .filter(|p| p.has_matured(now_ms))
            .map(|p| p.user_id.as_str())
            .collect();
        users.sort_unstable();
        users.dedup();
        let selected: HashSet<String> = users
            .into_iter()
            .take(max_users)
            .map(str::to_string)
            .collect();

        let mut grouped: BTreeMap<String, MaturedReward> = BTreeMap::new();
        let mut latest_context_at: BTreeMap<String, i64> = BTreeMap::new();

        for entry in pending.iter_mut() {
            if !selected.contains(&entry.user_id) {
                continue;
            }
            let mut amount = 0.0;
            let mut contributed = false;
            for bucket in entry.buckets.iter_mut() {
                if !bucket.delivered && bucket.due_ms <= now_ms {
                    bucket.delivered = true;
                    amount += bucket.amount;
                    contributed = true;
                }
            }
            if !contributed {
                continue;
            }

            let matured = grouped
                .entry(entry.user_id.clone())
                .or_insert_with(|| MaturedReward {
                    user_id: entry.user_id.clone(),
                    total: 0.0,
                    context: None,
                    attempts: 0,
                    contributions: 0,
                });
            matured.total += amount;
            matured.contributions += 1;
            matured.attempts = matured.attempts.max(entry.attempts);

            if let Some(context) = &entry.context {
                let newest = latest_context_at
                    .get(&entry.user_id)
                    .map_or(true, |at| entry.created_at >= *at);
                if newest {
                    latest_context_at.insert(entry.user_id.clone(), entry.created_at);
                    matured.context = Some(context.clone());
                }
            }
        }

        pending.retain(|p| !p.is_exhausted());
        grouped.into_values().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_for_user(&self, user_id: &str) -> usize {
        self.pending
            .lock()
            .iter()
            .filter(|p| p.user_id == user_id)
            .count()
    }

    /// Undelivered amount still owed to a user.
    pub fn outstanding(&self, user_id: &str) -> f64 {
        self.pending
            .lock()
            .iter()
            .filter(|p| p.user_id == user_id)
            .flat_map(|p| p.buckets.iter())
            .filter(|b| !b.delivered)
            .map(|b| b.amount)
            .sum()
    }

    pub fn get_state(&self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            version: SNAPSHOT_VERSION,
            pending: self.pending.lock().clone(),
        }
    }

    pub fn set_state(&self, snapshot: AggregatorSnapshot) -> Result<(), ScheduleError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ScheduleError::SnapshotVersion(snapshot.version));
        }
        *self.pending.lock() = snapshot.pending;
        Ok(())
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 3_600_000;

    fn aggregator() -> DelayedRewardAggregator {
        DelayedRewardAggregator::new(vec![
            RewardScheduleEntry::new(0, 0.4, "immediate"),
            RewardScheduleEntry::new(3600, 0.3, "1h"),
            RewardScheduleEntry::new(86400, 0.3, "24h"),
        ])
        .unwrap()
    }

    #[test]
    fn schedule_validation() {
        assert_eq!(validate_schedule(&[]), Err(ScheduleError::Empty));
        assert!(matches!(
            validate_schedule(&[
                RewardScheduleEntry::new(0, 0.5, "a"),
                RewardScheduleEntry::new(0, 0.5, "b"),
            ]),
            Err(ScheduleError::DuplicateDelay(0))
        ));
        assert!(matches!(
            validate_schedule(&[
                RewardScheduleEntry::new(0, 1.5, "a"),
                RewardScheduleEntry::new(10, -0.5, "b"),
            ]),
            Err(ScheduleError::InvalidWeight { .. })
        ));
        assert!(matches!(
            validate_schedule(&[RewardScheduleEntry::new(0, 0.9, "a")]),
            Err(ScheduleError::WeightSum(_))
        ));
        assert!(validate_schedule(&[RewardScheduleEntry::new(0, 1.0, "all")]).is_ok());
    }

    #[test]
    fn partials_mature_on_schedule() {
        let agg = aggregator();
        agg.add_reward("u1", 1.0, None, 0).unwrap();

        let first = agg.drain_matured(0, 10);
        assert_eq!(first.len(), 1);
        assert!((first[0].total - 0.4).abs() < 1e-12);

        assert!(agg.drain_matured(HOUR_MS - 1, 10).is_empty());
        let second = agg.drain_matured(HOUR_MS, 10);
        assert!((second[0].total - 0.3).abs() < 1e-12);

        let third = agg.drain_matured(24 * HOUR_MS, 10);
        assert!((third[0].total - 0.3).abs() < 1e-12);
        assert_eq!(agg.pending_count(), 0);
    }

    #[test]
    fn drain_sums_per_user_and_keeps_latest_context() {
        let agg = aggregator();
        let older = RewardContext {
            action_index: Some(1),
            ..RewardContext::default()
        };
        let newer = RewardContext {
            action_index: Some(4),
            ..RewardContext::default()
        };
        agg.add_reward("u1", 1.0, Some(older), 0).unwrap();
        agg.add_reward("u1", 0.5, Some(newer), 10).unwrap();

        let drained = agg.drain_matured(10, 10);
        assert_eq!(drained.len(), 1);
        assert!((drained[0].total - 0.6).abs() < 1e-12);
        assert_eq!(drained[0].contributions, 2);
        assert_eq!(drained[0].context.as_ref().unwrap().action_index, Some(4));
    }

    #[test]
    fn batch_limit_uses_user_order() {
        let agg = aggregator();
        for user in ["carol", "alice", "bob"] {
            agg.add_reward(user, 1.0, None, 0).unwrap();
        }
        let first: Vec<_> = agg
            .drain_matured(0, 2)
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        assert_eq!(first, vec!["alice", "bob"]);
        let rest = agg.drain_matured(0, 2);
        assert_eq!(rest[0].user_id, "carol");
    }

    #[test]
    fn snapshot_resumes_in_fresh_instance() {
        let agg = aggregator();
        agg.add_reward("u1", 1.0, None, 0).unwrap();
        agg.drain_matured(0, 10);
        let snapshot = agg.get_state();

        let json = serde_json::to_string(&snapshot).unwrap();
        let restored = aggregator();
        restored
            .set_state(serde_json::from_str(&json).unwrap())
            .unwrap();

        assert!((restored.outstanding("u1") - 0.6).abs() < 1e-12);
        let later = restored.drain_matured(24 * HOUR_MS, 10);
        assert!((later[0].total - 0.6).abs() < 1e-12);
    }

    #[test]
    fn requeue_increments_attempts() {
        let agg = aggregator();
        agg.add_reward("u1", 1.0, None, 0).unwrap();
        let matured = agg.drain_matured(0, 10).remove(0);
        agg.requeue(&matured, 5);

        let again = agg.drain_matured(5, 10).remove(0);
        assert_eq!(again.attempts, 1);
        assert!((again.total - 0.4).abs() < 1e-12);
    }

    #[test]
    fn non_finite_reward_is_rejected() {
        let agg = aggregator();
        assert!(agg.add_reward("u1", f64::NAN, None, 0).is_err());
        assert_eq!(agg.pending_count(), 0);
    }

    #[test]
    fn quality_filter_serde_shape() {
        let filter: QualityFilter =
            serde_json::from_str(r#"{"type":"fatigueThreshold","threshold":0.8}"#).unwrap();
        assert_eq!(filter, QualityFilter::FatigueThreshold(0.8));
        let none: QualityFilter = serde_json::from_str(r#"{"type":"none"}"#).unwrap();
        assert_eq!(none, QualityFilter::None);
    }
}
