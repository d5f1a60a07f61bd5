use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::amas::delayed_reward::{validate_schedule, QualityFilter, RewardScheduleEntry};
use crate::amas::optimizer::{validate_space, ParamBound};
use crate::amas::types::{Action, DifficultyLevel};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to parse {name}: {reason}")]
    Env { name: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationStat {
    pub mean: f64,
    pub std_dev: f64,
}

impl NormalizationStat {
    pub fn z_score(&self, value: f64) -> f64 {
        if self.std_dev <= 0.0 {
            return 0.0;
        }
        (value - self.mean) / self.std_dev
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionConfig {
    pub rt: NormalizationStat,
    pub pause: NormalizationStat,
    pub focus_loss: NormalizationStat,
    pub switches: NormalizationStat,
    pub dwell: NormalizationStat,
    pub max_retry_count: i32,
    pub max_response_time: i64,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            rt: NormalizationStat { mean: 3000.0, std_dev: 1500.0 },
            pause: NormalizationStat { mean: 2.0, std_dev: 2.0 },
            focus_loss: NormalizationStat { mean: 5000.0, std_dev: 3000.0 },
            switches: NormalizationStat { mean: 1.0, std_dev: 1.0 },
            dwell: NormalizationStat { mean: 8000.0, std_dev: 4000.0 },
            max_retry_count: 3,
            max_response_time: 30000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionWeights {
    pub bias: f64,
    pub rt_mean: f64,
    pub rt_cv: f64,
    pub pause: f64,
    pub switch: f64,
    pub focus_loss: f64,
    pub dwell: f64,
}

impl Default for AttentionWeights {
    fn default() -> Self {
        Self {
            bias: 1.0,
            rt_mean: 0.4,
            rt_cv: 0.6,
            pause: 0.3,
            switch: 0.3,
            focus_loss: 0.4,
            dwell: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FatigueParams {
    pub beta: f64,
    pub gamma: f64,
    pub delta: f64,
    pub k: f64,
    /// Minutes without events after which fatigue is fully recovered.
    pub long_break_threshold: f64,
    pub baseline_alpha: f64,
}

impl Default for FatigueParams {
    fn default() -> Self {
        Self {
            beta: 0.3,
            gamma: 0.3,
            delta: 0.2,
            k: 0.05,
            long_break_threshold: 30.0,
            baseline_alpha: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotivationParams {
    pub rho: f64,
    pub kappa: f64,
    pub lambda: f64,
    pub mu: f64,
}

impl Default for MotivationParams {
    fn default() -> Self {
        Self {
            rho: 0.9,
            kappa: 0.1,
            lambda: 0.15,
            mu: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CognitiveParams {
    pub memory_alpha: f64,
    pub speed_baseline_ms: f64,
    pub stability_window: usize,
}

impl Default for CognitiveParams {
    fn default() -> Self {
        Self {
            memory_alpha: 0.1,
            speed_baseline_ms: 3000.0,
            stability_window: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    pub alpha: f64,
    pub lambda: f64,
    pub cold_start_boost: bool,
    pub full_recompute_interval: u64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            lambda: 1.0,
            cold_start_boost: true,
            full_recompute_interval: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub accuracy_weight: f64,
    pub speed_weight: f64,
    pub stability_weight: f64,
    pub retention_weight: f64,
    pub hint_penalty: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            accuracy_weight: 0.4,
            speed_weight: 0.2,
            stability_weight: 0.2,
            retention_weight: 0.2,
            hint_penalty: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub target_low: f64,
    pub target_high: f64,
    pub flow_threshold: f64,
    pub min_events: usize,
    pub window_size: usize,
    pub attention_weight: f64,
    pub motivation_weight: f64,
    /// Width of the gaussian tail applied to success rates outside the band.
    pub outside_band_width: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            target_low: 0.65,
            target_high: 0.80,
            flow_threshold: 0.7,
            min_events: 5,
            window_size: 10,
            attention_weight: 0.6,
            motivation_weight: 0.4,
            outside_band_width: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionConfig {
    pub min_events: usize,
    pub frustration_streak: usize,
    pub anxiety_rt_cv: f64,
    pub anxiety_error_rate: f64,
    pub skip_threshold_ms: i64,
    pub boredom_skip_count: usize,
    pub boredom_dwell_ratio: f64,
    pub tired_fatigue: f64,
    pub engaged_accuracy: f64,
    pub engaged_attention: f64,
}

impl Default for EmotionConfig {
    fn default() -> Self {
        Self {
            min_events: 5,
            frustration_streak: 3,
            anxiety_rt_cv: 0.5,
            anxiety_error_rate: 0.4,
            skip_threshold_ms: 1000,
            boredom_skip_count: 3,
            boredom_dwell_ratio: 1.2,
            tired_fatigue: 0.7,
            engaged_accuracy: 0.7,
            engaged_attention: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    pub latency_budget_ms: f64,
    pub recent_window: usize,
    pub inactive_ttl_ms: i64,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            latency_budget_ms: 50.0,
            recent_window: 20,
            inactive_ttl_ms: 30 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayedRewardConfig {
    pub schedule: Vec<RewardScheduleEntry>,
    pub batch_size: usize,
    pub quality_filter: QualityFilter,
    pub max_apply_attempts: u32,
    pub cycle_schedule: String,
}

impl Default for DelayedRewardConfig {
    fn default() -> Self {
        Self {
            schedule: vec![
                RewardScheduleEntry::new(0, 0.4, "immediate"),
                RewardScheduleEntry::new(3600, 0.3, "1h"),
                RewardScheduleEntry::new(86400, 0.3, "24h"),
            ],
            batch_size: 100,
            quality_filter: QualityFilter::None,
            max_apply_attempts: 3,
            cycle_schedule: "0 * * * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub enabled: bool,
    pub params: Vec<ParamBound>,
    pub beta: f64,
    pub initial_samples: usize,
    pub candidate_count: usize,
    pub length_scale: f64,
    pub noise: f64,
    pub seed: u64,
    pub min_rewards_per_evaluation: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            params: vec![
                ParamBound::new("alpha", 0.1, 2.0),
                ParamBound::new("fatigue_k", 0.01, 0.2),
                ParamBound::new("motivation_rho", 0.6, 0.99),
            ],
            beta: 2.0,
            initial_samples: 5,
            candidate_count: 256,
            length_scale: 0.25,
            noise: 1e-3,
            seed: 42,
            min_rewards_per_evaluation: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub queue_capacity: usize,
    pub flush_interval_ms: u64,
    pub max_batch_size: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub backpressure_timeout_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            flush_interval_ms: 1000,
            max_batch_size: 200,
            max_retries: 3,
            retry_base_delay_ms: 100,
            backpressure_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub state_ttl_secs: u64,
    pub model_ttl_secs: u64,
    pub jitter_ratio: f64,
    pub lock_ttl_ms: u64,
    pub lock_retry_attempts: u32,
    pub lock_backoff_min_ms: u64,
    pub lock_backoff_max_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            state_ttl_secs: 30 * 60,
            model_ttl_secs: 60 * 60,
            jitter_ratio: 0.1,
            lock_ttl_ms: 3000,
            lock_retry_attempts: 5,
            lock_backoff_min_ms: 20,
            lock_backoff_max_ms: 80,
        }
    }
}

pub fn default_action_space() -> Vec<Action> {
    let tiers = [
        (DifficultyLevel::Easy, 2, 0.1),
        (DifficultyLevel::Mid, 1, 0.2),
        (DifficultyLevel::Hard, 0, 0.3),
    ];
    let pacing = [(5, 1.2), (8, 1.0), (12, 0.8)];

    let mut actions = Vec::with_capacity(tiers.len() * pacing.len());
    for (difficulty, hint_level, new_ratio) in tiers {
        for (batch_size, interval_scale) in pacing {
            actions.push(Action {
                interval_scale,
                new_ratio,
                difficulty,
                batch_size,
                hint_level,
            });
        }
    }
    actions
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AMASConfig {
    pub perception: PerceptionConfig,
    pub attention_weights: AttentionWeights,
    /// Weight of the newest attention observation in the smoothing filter.
    pub attention_smoothing: f64,
    pub fatigue: FatigueParams,
    pub motivation: MotivationParams,
    pub cognitive: CognitiveParams,
    pub bandit: BanditConfig,
    pub reward: RewardConfig,
    pub flow: FlowConfig,
    pub emotion: EmotionConfig,
    pub online: OnlineConfig,
    pub action_space: Vec<Action>,
    pub delayed_reward: DelayedRewardConfig,
    pub optimizer: OptimizerConfig,
    pub recorder: RecorderConfig,
    pub cache: CacheConfig,
}

impl Default for AMASConfig {
    fn default() -> Self {
        Self {
            perception: PerceptionConfig::default(),
            attention_weights: AttentionWeights::default(),
            attention_smoothing: 0.3,
            fatigue: FatigueParams::default(),
            motivation: MotivationParams::default(),
            cognitive: CognitiveParams::default(),
            bandit: BanditConfig::default(),
            reward: RewardConfig::default(),
            flow: FlowConfig::default(),
            emotion: EmotionConfig::default(),
            online: OnlineConfig::default(),
            action_space: default_action_space(),
            delayed_reward: DelayedRewardConfig::default(),
            optimizer: OptimizerConfig::default(),
            recorder: RecorderConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

fn env_parse<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Env {
                name,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_json<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: serde::de::DeserializeOwned,
{
    match std::env::var(name) {
        Ok(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| ConfigError::Env {
                name,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl AMASConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|e| invalid("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = env_parse("AMAS_BANDIT_ALPHA")? {
            config.bandit.alpha = val;
        }
        if let Some(val) = env_parse("AMAS_BANDIT_LAMBDA")? {
            config.bandit.lambda = val;
        }
        if let Some(val) = env_parse("AMAS_LATENCY_BUDGET_MS")? {
            config.online.latency_budget_ms = val;
        }
        if let Some(val) = env_parse("AMAS_RECENT_WINDOW")? {
            config.online.recent_window = val;
        }
        if let Some(val) = env_parse("AMAS_CACHE_MAX_AGE_MS")? {
            config.online.inactive_ttl_ms = val;
        }
        if let Some(val) = env_parse("AMAS_FLOW_TARGET_LOW")? {
            config.flow.target_low = val;
        }
        if let Some(val) = env_parse("AMAS_FLOW_TARGET_HIGH")? {
            config.flow.target_high = val;
        }
        if let Some(val) = env_parse("AMAS_FLOW_THRESHOLD")? {
            config.flow.flow_threshold = val;
        }
        if let Some(val) = env_parse("AMAS_OFFLINE_BATCH_SIZE")? {
            config.delayed_reward.batch_size = val;
        }
        if let Some(val) = env_parse::<String>("AMAS_OFFLINE_SCHEDULE")? {
            config.delayed_reward.cycle_schedule = val;
        }
        if let Some(schedule) = env_json("AMAS_REWARD_SCHEDULE")? {
            config.delayed_reward.schedule = schedule;
        }
        if let Some(filter) = env_json("AMAS_REWARD_QUALITY_FILTER")? {
            config.delayed_reward.quality_filter = filter;
        }
        if let Some(actions) = env_json("AMAS_ACTION_SPACE")? {
            config.action_space = actions;
        }
        if let Some(val) = env_parse("AMAS_OPTIMIZER_ENABLED")? {
            config.optimizer.enabled = val;
        }
        if let Some(params) = env_json("AMAS_OPTIMIZER_PARAMS")? {
            config.optimizer.params = params;
        }
        if let Some(val) = env_parse("AMAS_RECORDER_QUEUE_CAPACITY")? {
            config.recorder.queue_capacity = val;
        }
        if let Some(val) = env_parse("AMAS_RECORDER_FLUSH_INTERVAL_MS")? {
            config.recorder.flush_interval_ms = val;
        }
        if let Some(val) = env_parse("AMAS_RECORDER_MAX_RETRIES")? {
            config.recorder.max_retries = val;
        }
        if let Some(val) = env_parse("AMAS_RECORDER_BACKPRESSURE_TIMEOUT_MS")? {
            config.recorder.backpressure_timeout_ms = val;
        }
        if let Some(val) = env_parse("AMAS_CACHE_TTL_JITTER")? {
            config.cache.jitter_ratio = val;
        }
        if let Some(val) = env_parse("AMAS_STATE_TTL_SECS")? {
            config.cache.state_ttl_secs = val;
        }
        if let Some(val) = env_parse("AMAS_MODEL_TTL_SECS")? {
            config.cache.model_ttl_secs = val;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.attention_smoothing > 0.0 && self.attention_smoothing <= 1.0) {
            return Err(invalid("attention_smoothing", "must be in (0, 1]"));
        }
        let f = &self.fatigue;
        if [f.beta, f.gamma, f.delta, f.k, f.long_break_threshold]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(invalid("fatigue", "parameters must be finite and non-negative"));
        }
        if !(f.baseline_alpha > 0.0 && f.baseline_alpha <= 1.0) {
            return Err(invalid("fatigue.baseline_alpha", "must be in (0, 1]"));
        }
        let m = &self.motivation;
        if !(m.rho > 0.0 && m.rho < 1.0) {
            return Err(invalid("motivation.rho", "must be in (0, 1)"));
        }
        if [m.kappa, m.lambda, m.mu].iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(invalid("motivation", "kappa, lambda and mu must be non-negative"));
        }
        if !(self.cognitive.memory_alpha > 0.0 && self.cognitive.memory_alpha <= 1.0) {
            return Err(invalid("cognitive.memory_alpha", "must be in (0, 1]"));
        }
        if self.cognitive.speed_baseline_ms <= 0.0 || self.cognitive.stability_window == 0 {
            return Err(invalid("cognitive", "baseline and window must be positive"));
        }
        if !(self.bandit.alpha.is_finite() && self.bandit.alpha >= 0.0) {
            return Err(invalid("bandit.alpha", "must be finite and non-negative"));
        }
        if !(self.bandit.lambda.is_finite() && self.bandit.lambda > 0.0) {
            return Err(invalid("bandit.lambda", "must be positive"));
        }

        let flow = &self.flow;
        if !(0.0..=1.0).contains(&flow.target_low)
            || !(0.0..=1.0).contains(&flow.target_high)
            || flow.target_low >= flow.target_high
        {
            return Err(invalid("flow", "target band must satisfy 0 <= low < high <= 1"));
        }
        if !(0.0..=1.0).contains(&flow.flow_threshold) {
            return Err(invalid("flow.flow_threshold", "must be in [0, 1]"));
        }
        if flow.min_events == 0 || flow.window_size < flow.min_events {
            return Err(invalid("flow", "window_size must be >= min_events >= 1"));
        }
        if (flow.attention_weight + flow.motivation_weight - 1.0).abs() > 1e-6
            || flow.attention_weight < 0.0
            || flow.motivation_weight < 0.0
        {
            return Err(invalid("flow", "state weights must be non-negative and sum to 1"));
        }
        if flow.outside_band_width <= 0.0 {
            return Err(invalid("flow.outside_band_width", "must be positive"));
        }
        if self.emotion.min_events == 0 {
            return Err(invalid("emotion.min_events", "must be at least 1"));
        }

        if !(self.online.latency_budget_ms > 0.0) || self.online.recent_window == 0 {
            return Err(invalid("online", "budget and window must be positive"));
        }

        validate_schedule(&self.delayed_reward.schedule)
            .map_err(|e| invalid("delayed_reward.schedule", e.to_string()))?;
        if self.delayed_reward.batch_size == 0 {
            return Err(invalid("delayed_reward.batch_size", "must be at least 1"));
        }
        if self.delayed_reward.max_apply_attempts == 0 {
            return Err(invalid("delayed_reward.max_apply_attempts", "must be at least 1"));
        }

        validate_space(&self.optimizer.params)
            .map_err(|e| invalid("optimizer.params", e.to_string()))?;
        if !(self.optimizer.beta.is_finite() && self.optimizer.beta >= 0.0) {
            return Err(invalid("optimizer.beta", "must be finite and non-negative"));
        }
        if self.optimizer.candidate_count == 0 || self.optimizer.length_scale <= 0.0 {
            return Err(invalid("optimizer", "candidate_count and length_scale must be positive"));
        }

        if self.recorder.queue_capacity == 0 || self.recorder.max_batch_size == 0 {
            return Err(invalid("recorder", "queue_capacity and max_batch_size must be positive"));
        }
        if !(0.0..1.0).contains(&self.cache.jitter_ratio) {
            return Err(invalid("cache.jitter_ratio", "must be in [0, 1)"));
        }
        if self.cache.lock_backoff_min_ms > self.cache.lock_backoff_max_ms {
            return Err(invalid("cache", "lock_backoff_min_ms must not exceed lock_backoff_max_ms"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AMASConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.action_space.len(), 9);
        assert_eq!(config.recorder.queue_capacity, 1000);
    }

    #[test]
    fn inverted_flow_band_is_rejected() {
        let mut config = AMASConfig::default();
        config.flow.target_low = 0.9;
        config.flow.target_high = 0.6;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "flow", .. })
        ));
    }

    #[test]
    fn malformed_schedule_is_rejected() {
        let mut config = AMASConfig::default();
        config.delayed_reward.schedule = vec![RewardScheduleEntry::new(0, 0.5, "immediate")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = AMASConfig::from_json(r#"{"bandit": {"alpha": 1.5}}"#).unwrap();
        assert_eq!(config.bandit.alpha, 1.5);
        assert_eq!(config.bandit.lambda, 1.0);
        assert_eq!(config.flow.window_size, 10);
    }
}
