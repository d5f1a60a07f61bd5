use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::amas::config::DelayedRewardConfig;
use crate::amas::decision::DecisionPolicy;
use crate::amas::delayed_reward::{DelayedRewardAggregator, MaturedReward, QualityFilter};
use crate::amas::metrics::AmasMetrics;
use crate::amas::optimizer::{BayesianOptimizer, OptimizerError, OptimizerState};
use crate::amas::persistence::{AmasRepository, RepositoryError, UserStateProvider};
use crate::core::{EventBus, LearningEvent, RewardDistributedPayload};

const ALPHA_PARAM: &str = "alpha";

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("reward rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Destination of aggregated delayed rewards.
#[async_trait]
pub trait RewardApplier: Send + Sync {
    async fn apply_reward(
        &self,
        user_id: &str,
        reward: f64,
        feature_vector: Option<&[f64]>,
        action_index: Option<usize>,
    ) -> Result<(), ApplyError>;
}

/// Feeds rewards into the bandit and persists the updated model.
pub struct PolicyRewardApplier {
    policy: Arc<DecisionPolicy>,
    repository: Option<Arc<dyn AmasRepository>>,
}

impl PolicyRewardApplier {
    pub fn new(policy: Arc<DecisionPolicy>, repository: Option<Arc<dyn AmasRepository>>) -> Self {
        Self { policy, repository }
    }
}

#[async_trait]
impl RewardApplier for PolicyRewardApplier {
    async fn apply_reward(
        &self,
        user_id: &str,
        reward: f64,
        feature_vector: Option<&[f64]>,
        _action_index: Option<usize>,
    ) -> Result<(), ApplyError> {
        let Some(x) = feature_vector else {
            debug!(user_id = %user_id, "Reward has no decision context, skipping bandit update");
            return Ok(());
        };

        if !self.policy.contains(user_id) {
            if let Some(repository) = &self.repository {
                if let Some(model) = repository.load_model(user_id).await? {
                    self.policy.restore(user_id, model);
                }
            }
        }

        if !self.policy.update(user_id, x, reward) {
            return Err(ApplyError::Rejected(format!(
                "bandit update rejected for context of dimension {}",
                x.len()
            )));
        }

        if let (Some(repository), Some(model)) = (&self.repository, self.policy.snapshot(user_id)) {
            repository.save_model(user_id, &model).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfflineReport {
    pub users: usize,
    pub applied: usize,
    pub filtered: usize,
    pub requeued: usize,
    pub dropped: usize,
    /// Parameters adopted when this cycle completed an optimizer evaluation.
    pub suggestion: Option<BTreeMap<String, f64>>,
    pub duration_ms: u64,
}

struct Tuning {
    optimizer: BayesianOptimizer,
    current: Vec<f64>,
    rewards: Vec<f64>,
    min_rewards: usize,
}

/// Batch half of the adaptive loop.
pub struct OfflineLoop {
    aggregator: Arc<DelayedRewardAggregator>,
    applier: Arc<dyn RewardApplier>,
    config: DelayedRewardConfig,
    metrics: Arc<AmasMetrics>,
    policy: Arc<DecisionPolicy>,
    state_provider: Option<Arc<dyn UserStateProvider>>,
    events: Option<Arc<EventBus>>,
    tuning: Option<Mutex<Tuning>>,
}

impl OfflineLoop {
    pub fn new(
        aggregator: Arc<DelayedRewardAggregator>,
        applier: Arc<dyn RewardApplier>,
        policy: Arc<DecisionPolicy>,
        config: DelayedRewardConfig,
        metrics: Arc<AmasMetrics>,
    ) -> Self {
        Self {
            aggregator,
            applier,
            config,
            metrics,
            policy,
            state_provider: None,
            events: None,
            tuning: None,
        }
    }

    pub fn with_state_provider(mut self, provider: Arc<dyn UserStateProvider>) -> Self {
        self.state_provider = Some(provider);
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Attaches a tuner. Its first suggestion is adopted immediately so every
    /// later evaluation scores the parameters that were actually in use.
    pub fn with_optimizer(
        mut self,
        mut optimizer: BayesianOptimizer,
        min_rewards: usize,
    ) -> Self {
        let current = optimizer.suggest_next();
        self.adopt(&optimizer, &current);
        self.tuning = Some(Mutex::new(Tuning {
            optimizer,
            current,
            rewards: Vec::new(),
            min_rewards: min_rewards.max(1),
        }));
        self
    }

    pub fn aggregator(&self) -> &Arc<DelayedRewardAggregator> {
        &self.aggregator
    }

    pub fn current_params(&self) -> Option<BTreeMap<String, f64>> {
        let tuning = self.tuning.as_ref()?.lock();
        Some(tuning.optimizer.params_map(&tuning.current))
    }

    pub fn optimizer_state(&self) -> Option<OptimizerState> {
        self.tuning.as_ref().map(|t| t.lock().optimizer.get_state())
    }

    pub fn restore_optimizer(&self, state: OptimizerState) -> Result<(), OptimizerError> {
        match &self.tuning {
            Some(tuning) => tuning.lock().optimizer.set_state(state),
            None => Ok(()),
        }
    }

    pub async fn run_cycle(&self) -> OfflineReport {
        self.process_once(Utc::now().timestamp_millis()).await
    }

    pub async fn process_once(&self, now_ms: i64) -> OfflineReport {
        let start = Instant::now();
        let matured = self.aggregator.drain_matured(now_ms, self.config.batch_size.max(1));
        let mut report = OfflineReport {
            users: matured.len(),
            ..OfflineReport::default()
        };
        if matured.is_empty() {
            debug!("No matured rewards");
            return report;
        }

        let mut applied_values = Vec::with_capacity(matured.len());
        for reward in &matured {
            if !self.passes_filter(reward).await {
                report.filtered += 1;
                AmasMetrics::incr(&self.metrics.rewards_filtered);
                debug!(user_id = %reward.user_id, reward = reward.total, "Reward filtered by quality gate");
                continue;
            }

            let context = reward.context.as_ref();
            let result = self
                .applier
                .apply_reward(
                    &reward.user_id,
                    reward.total,
                    context.and_then(|c| c.feature_vector.as_deref()),
                    context.and_then(|c| c.action_index),
                )
                .await;

            match result {
                Ok(()) => {
                    report.applied += 1;
                    applied_values.push(reward.total);
                    AmasMetrics::incr(&self.metrics.rewards_applied);
                    self.publish(reward, now_ms);
                }
                Err(e) if reward.attempts + 1 < self.config.max_apply_attempts => {
                    report.requeued += 1;
                    self.aggregator.requeue(reward, now_ms);
                    warn!(
                        user_id = %reward.user_id,
                        attempt = reward.attempts + 1,
                        error = %e,
                        "Reward application failed, requeued"
                    );
                }
                Err(e) => {
                    report.dropped += 1;
                    AmasMetrics::incr(&self.metrics.rewards_dropped);
                    error!(
                        user_id = %reward.user_id,
                        reward = reward.total,
                        attempts = reward.attempts + 1,
                        error = %e,
                        "Reward dropped after exhausting attempts"
                    );
                }
            }
        }

        report.suggestion = self.tune(&applied_values, now_ms);
        report.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            users = report.users,
            applied = report.applied,
            filtered = report.filtered,
            requeued = report.requeued,
            dropped = report.dropped,
            duration_ms = report.duration_ms,
            "Offline reward cycle completed"
        );
        report
    }

    async fn passes_filter(&self, reward: &MaturedReward) -> bool {
        match self.config.quality_filter {
            QualityFilter::None => true,
            QualityFilter::EvaluationThreshold(threshold) => reward.total.abs() >= threshold,
            QualityFilter::FatigueThreshold(threshold) => {
                let Some(provider) = &self.state_provider else {
                    return true;
                };
                match provider.get_user_state(&reward.user_id).await {
                    Some(state) => state.fatigue <= threshold,
                    None => true,
                }
            }
        }
    }

    fn publish(&self, reward: &MaturedReward, now_ms: i64) {
        let Some(events) = &self.events else {
            return;
        };
        events.publish(LearningEvent::RewardDistributed(RewardDistributedPayload {
            user_id: reward.user_id.clone(),
            reward_value: reward.total,
            contributions: reward.contributions,
            action_index: reward.context.as_ref().and_then(|c| c.action_index),
            timestamp: chrono::DateTime::from_timestamp_millis(now_ms).unwrap_or_else(Utc::now),
        }));
    }

    fn tune(&self, applied: &[f64], now_ms: i64) -> Option<BTreeMap<String, f64>> {
        let mut tuning = self.tuning.as_ref()?.lock();
        tuning.rewards.extend_from_slice(applied);
        if tuning.rewards.len() < tuning.min_rewards {
            return None;
        }

        let mean = tuning.rewards.iter().sum::<f64>() / tuning.rewards.len() as f64;
        tuning.rewards.clear();

        let current = tuning.current.clone();
        if let Err(e) = tuning.optimizer.record_evaluation(&current, mean, now_ms) {
            warn!(error = %e, "Optimizer rejected evaluation");
            return None;
        }

        let next = tuning.optimizer.suggest_next();
        self.adopt(&tuning.optimizer, &next);
        let suggestion = tuning.optimizer.params_map(&next);
        tuning.current = next;

        info!(
            evaluations = tuning.optimizer.evaluation_count(),
            score = mean,
            "Adopted optimizer suggestion"
        );
        Some(suggestion)
    }

    fn adopt(&self, optimizer: &BayesianOptimizer, params: &[f64]) {
        if let Some(alpha) = optimizer.params_map(params).get(ALPHA_PARAM) {
            self.policy.set_alpha(*alpha);
        }
    }
}
