use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::amas::config::AMASConfig;
use crate::amas::decision::{DecisionContext, DecisionPolicy};
use crate::amas::delayed_reward::{DelayedRewardAggregator, RewardContext};
use crate::amas::features::FeatureBuilder;
use crate::amas::metrics::AmasMetrics;
use crate::amas::modeling::{
    interaction_confidence, AttentionMonitor, CognitiveProfiler, EmotionDetector, EmotionResult,
    FatigueEstimator, FlowDetector, FlowResult, MotivationTracker,
};
use crate::amas::persistence::AmasRepository;
use crate::amas::reward::ImmediateRewardEvaluator;
use crate::amas::types::{
    Action, DecisionSource, DecisionTrace, FeatureVector, PipelineStage, PipelineStageTrace,
    RawEvent, Reward, UserState,
};
use crate::services::decision_recorder::DecisionRecorder;

/// Per-call signals supplied by the host next to the event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessContext {
    pub recent_error_rate: f64,
    pub recent_response_time: f64,
    pub time_bucket: u32,
    pub interaction_count: Option<u64>,
}

impl Default for ProcessContext {
    fn default() -> Self {
        let decision = DecisionContext::default();
        Self {
            recent_error_rate: decision.recent_error_rate,
            recent_response_time: decision.recent_response_time,
            time_bucket: decision.time_bucket,
            interaction_count: None,
        }
    }
}

impl ProcessContext {
    fn decision_context(&self) -> DecisionContext {
        DecisionContext {
            recent_error_rate: self.recent_error_rate,
            recent_response_time: self.recent_response_time,
            time_bucket: self.time_bucket,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnlineDecision {
    pub decision_id: String,
    pub action: Action,
    /// Position in the configured action space; `None` for the fallback.
    pub action_index: Option<usize>,
    pub confidence: f64,
    pub source: DecisionSource,
    /// Bandit context vector of the chosen action.
    pub context_vector: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTimings {
    pub feature_ms: f64,
    pub cognitive_ms: f64,
    pub decision_ms: f64,
    pub reward_ms: f64,
}

impl StageTimings {
    pub fn total(&self) -> f64 {
        self.feature_ms + self.cognitive_ms + self.decision_ms + self.reward_ms
    }
}

#[derive(Debug, Clone)]
pub struct OnlineResult {
    pub updated_state: UserState,
    pub decision: OnlineDecision,
    pub reward: Reward,
    pub features: FeatureVector,
    pub flow: Option<FlowResult>,
    pub emotion: Option<EmotionResult>,
    pub elapsed_ms: f64,
    pub timings: StageTimings,
}

struct UserSession {
    attention: AttentionMonitor,
    fatigue: FatigueEstimator,
    motivation: MotivationTracker,
    cognitive: CognitiveProfiler,
    recent: VecDeque<RawEvent>,
    state: Option<UserState>,
    interactions: u64,
    seeded: bool,
    last_active_ms: i64,
}

impl UserSession {
    fn new(config: &AMASConfig) -> Self {
        Self {
            attention: AttentionMonitor::new(
                config.attention_weights.clone(),
                config.attention_smoothing,
            ),
            fatigue: FatigueEstimator::new(config.fatigue.clone()),
            motivation: MotivationTracker::new(config.motivation.clone()),
            cognitive: CognitiveProfiler::new(config.cognitive.clone()),
            recent: VecDeque::with_capacity(config.online.recent_window),
            state: None,
            interactions: 0,
            seeded: false,
            last_active_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn seed(&mut self, state: &UserState) {
        self.attention.set_value(state.attention);
        self.fatigue.set_value(state.fatigue);
        if state.ts > 0 {
            self.fatigue.set_last_event_ts(state.ts);
        }
        self.motivation.set_value(state.motivation);
        self.cognitive.set_profile(&state.cognitive);
        self.seeded = true;
    }
}

/// Real-time half of the adaptive loop: event in, state/decision/reward out.
///
/// Each user owns a session (estimators and recent events) behind an async
/// mutex, so one user's events apply in arrival order while different users
/// proceed independently.
pub struct OnlineLoop {
    config: Arc<AMASConfig>,
    features: FeatureBuilder,
    evaluator: ImmediateRewardEvaluator,
    flow: FlowDetector,
    emotion: EmotionDetector,
    policy: Arc<DecisionPolicy>,
    metrics: Arc<AmasMetrics>,
    sessions: RwLock<HashMap<String, Arc<Mutex<UserSession>>>>,
    repository: Option<Arc<dyn AmasRepository>>,
    recorder: Option<DecisionRecorder>,
    aggregator: Option<Arc<DelayedRewardAggregator>>,
}

impl OnlineLoop {
    pub fn new(config: Arc<AMASConfig>, policy: Arc<DecisionPolicy>, metrics: Arc<AmasMetrics>) -> Self {
        Self {
            features: FeatureBuilder::new(config.perception.clone()),
            evaluator: ImmediateRewardEvaluator::new(config.reward.clone(), config.perception.clone()),
            flow: FlowDetector::new(config.flow.clone()),
            emotion: EmotionDetector::new(config.emotion.clone()),
            config,
            policy,
            metrics,
            sessions: RwLock::new(HashMap::new()),
            repository: None,
            recorder: None,
            aggregator: None,
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn AmasRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_recorder(mut self, recorder: DecisionRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<DelayedRewardAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn policy(&self) -> &Arc<DecisionPolicy> {
        &self.policy
    }

    fn session(&self, user_id: &str) -> Arc<Mutex<UserSession>> {
        if let Some(session) = self.sessions.read().get(user_id) {
            return Arc::clone(session);
        }
        let fresh = UserSession::new(&self.config);
        let mut sessions = self.sessions.write();
        Arc::clone(
            sessions
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(fresh))),
        )
    }

    async fn resolve_state(&self, user_id: &str, cached: Option<&UserState>) -> UserState {
        if let Some(state) = cached {
            return state.clone();
        }
        if let Some(repository) = &self.repository {
            match repository.load_state(user_id).await {
                Ok(Some(state)) => return state,
                Ok(None) => {}
                Err(e) => warn!(user_id = %user_id, error = %e, "Failed to load user state, using default"),
            }
        }
        UserState::default()
    }

    async fn ensure_model(&self, user_id: &str) {
        let Some(repository) = &self.repository else {
            return;
        };
        if self.policy.contains(user_id) {
            return;
        }
        match repository.load_model(user_id).await {
            Ok(Some(model)) => self.policy.restore(user_id, model),
            Ok(None) => {}
            Err(e) => warn!(user_id = %user_id, error = %e, "Failed to load bandit model, starting cold"),
        }
    }

    pub async fn process(
        &self,
        user_id: &str,
        event: RawEvent,
        current_state: Option<UserState>,
        ctx: ProcessContext,
    ) -> OnlineResult {
        let started_at = chrono::Utc::now().timestamp_millis();
        let slot = self.session(user_id);
        let mut session = slot.lock().await;

        let prior = match current_state {
            Some(state) => state,
            None => self.resolve_state(user_id, session.state.as_ref()).await,
        };
        if !session.seeded {
            session.seed(&prior);
        }
        self.ensure_model(user_id).await;

        let mut timings = StageTimings::default();

        let clock = Instant::now();
        let features = self.features.build(&event);
        timings.feature_ms = elapsed_ms(clock);

        let clock = Instant::now();
        let attention = session.attention.update(&event, &features);
        let fatigue = session.fatigue.update(&event);
        let motivation = session.motivation.update(&event);
        let cognitive = session.cognitive.update(&event, ctx.recent_error_rate);

        session.recent.push_back(event.clone());
        while session.recent.len() > self.config.online.recent_window {
            session.recent.pop_front();
        }
        session.interactions += 1;
        let interactions = ctx.interaction_count.unwrap_or(session.interactions);

        let state = UserState {
            attention,
            fatigue,
            cognitive,
            motivation,
            conf: interaction_confidence(interactions),
            ts: event.timestamp,
        };

        let recent = session.recent.make_contiguous();
        let flow = match self.flow.detect(&state, recent) {
            Ok(result) => Some(result),
            Err(e) => {
                AmasMetrics::incr(&self.metrics.detection_failures);
                warn!(user_id = %user_id, error = %e, "Flow detection failed");
                None
            }
        };
        let emotion = match self.emotion.detect(&state, recent) {
            Ok(result) => Some(result),
            Err(e) => {
                AmasMetrics::incr(&self.metrics.detection_failures);
                warn!(user_id = %user_id, error = %e, "Emotion detection failed");
                None
            }
        };
        timings.cognitive_ms = elapsed_ms(clock);

        let clock = Instant::now();
        let decision = self.decide(user_id, &state, &ctx, interactions);
        timings.decision_ms = elapsed_ms(clock);

        let clock = Instant::now();
        let reward = self.evaluator.evaluate(&event, &state);
        timings.reward_ms = elapsed_ms(clock);

        let elapsed = timings.total();
        if elapsed > self.config.online.latency_budget_ms {
            AmasMetrics::incr(&self.metrics.budget_overruns);
            warn!(
                user_id = %user_id,
                elapsed_ms = elapsed,
                budget_ms = self.config.online.latency_budget_ms,
                "Online processing exceeded latency budget"
            );
        }

        session.state = Some(state.clone());
        session.last_active_ms = chrono::Utc::now().timestamp_millis();

        if let Some(repository) = &self.repository {
            if let Err(e) = repository.save_state(user_id, &state).await {
                warn!(user_id = %user_id, error = %e, "Failed to save user state");
            }
        }
        drop(session);

        let result = OnlineResult {
            updated_state: state,
            decision,
            reward,
            features,
            flow,
            emotion,
            elapsed_ms: elapsed,
            timings,
        };

        self.hand_off(user_id, &result, started_at).await;
        result
    }

    fn decide(
        &self,
        user_id: &str,
        state: &UserState,
        ctx: &ProcessContext,
        interactions: u64,
    ) -> OnlineDecision {
        AmasMetrics::incr(&self.metrics.decisions);
        let decision_id = uuid::Uuid::new_v4().to_string();
        let actions = &self.config.action_space;

        let selection = if actions.is_empty() {
            None
        } else {
            self.policy.select(
                user_id,
                state,
                &ctx.decision_context(),
                actions,
                Some(interactions),
            )
        };

        match selection {
            Some(selected) => OnlineDecision {
                decision_id,
                action: selected.action,
                action_index: Some(selected.index),
                confidence: selected.confidence,
                source: DecisionSource::Online,
                context_vector: Some(selected.features),
            },
            None => {
                AmasMetrics::incr(&self.metrics.fallback_decisions);
                warn!(
                    user_id = %user_id,
                    actions = actions.len(),
                    "No action selected, falling back to default"
                );
                OnlineDecision {
                    decision_id,
                    action: Action::default(),
                    action_index: None,
                    confidence: 0.0,
                    source: DecisionSource::Fallback,
                    context_vector: None,
                }
            }
        }
    }

    async fn hand_off(&self, user_id: &str, result: &OnlineResult, started_at: i64) {
        let decision = &result.decision;

        if let Some(aggregator) = &self.aggregator {
            let context = RewardContext {
                feature_vector: decision.context_vector.clone(),
                action_index: decision.action_index,
                decision_id: Some(decision.decision_id.clone()),
            };
            if let Err(e) = aggregator.add_reward(
                user_id,
                result.reward.value,
                Some(context),
                result.reward.ts,
            ) {
                warn!(user_id = %user_id, error = %e, "Failed to queue delayed reward");
            }
        }

        if let Some(recorder) = &self.recorder {
            recorder.record(self.build_trace(user_id, result, started_at)).await;
        }
    }

    fn build_trace(&self, user_id: &str, result: &OnlineResult, started_at: i64) -> DecisionTrace {
        let decision = &result.decision;
        let t = &result.timings;

        let mut trace = DecisionTrace::new(
            decision.decision_id.clone(),
            decision.action.clone(),
            started_at,
        );
        trace.user_id = Some(user_id.to_string());
        trace.decision_source = decision.source;
        trace.state_snapshot =
            serde_json::to_value(&result.updated_state).unwrap_or(serde_json::Value::Null);
        trace.weights_snapshot = Some(json!({ "alpha": self.policy.alpha() }));
        trace.confidence = decision.confidence;
        trace.reward = Some(result.reward.value);
        trace.feature_vector = decision.context_vector.clone();

        let mut offset = started_at as f64;
        let mut stage = |kind: PipelineStage, name: &str, duration: f64| {
            let entry = PipelineStageTrace::completed(kind, name, offset.round() as i64, duration);
            offset += duration;
            entry
        };

        let perception = stage(PipelineStage::Perception, "feature_builder", t.feature_ms)
            .with_output(json!({ "dimension": result.features.dim() }));
        let modeling = stage(PipelineStage::Modeling, "cognitive_estimators", t.cognitive_ms)
            .with_output(json!({
                "flow": result.flow.as_ref().map(|f| f.state.as_str()),
                "emotion": result.emotion.as_ref().map(|e| e.state.as_str()),
            }));
        let mut deciding = stage(PipelineStage::Decision, "linucb", t.decision_ms).with_output(json!({
            "actionIndex": decision.action_index,
            "confidence": decision.confidence,
        }));
        if decision.source == DecisionSource::Fallback {
            deciding = deciding.failed("no action selected, default applied");
        }
        let evaluation = stage(PipelineStage::Evaluation, "immediate_reward", t.reward_ms)
            .with_output(json!({ "reward": result.reward.value, "reason": result.reward.reason }));

        trace.pipeline_stages = vec![perception, modeling, deciding, evaluation];
        trace
    }

    /// Forgets the user's session and bandit model, including the persisted
    /// model so the next event starts from a fresh bandit.
    pub async fn reset_user(&self, user_id: &str) -> bool {
        let had_session = self.sessions.write().remove(user_id).is_some();
        let had_model = self.policy.remove(user_id);
        if let Some(repository) = &self.repository {
            if let Err(e) = repository.delete_model(user_id).await {
                warn!(user_id = %user_id, error = %e, "Failed to delete persisted model");
            }
        }
        had_session || had_model
    }

    /// Drops sessions idle for longer than `max_idle_ms`. Bandit models are
    /// evicted too when a repository can restore them later.
    pub fn cleanup_inactive(&self, max_idle_ms: i64) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - max_idle_ms;
        let mut sessions = self.sessions.write();
        let idle: Vec<String> = sessions
            .iter()
            .filter(|(_, slot)| {
                slot.try_lock()
                    .map(|s| s.last_active_ms < cutoff)
                    .unwrap_or(false)
            })
            .map(|(user_id, _)| user_id.clone())
            .collect();

        for user_id in &idle {
            sessions.remove(user_id);
            if self.repository.is_some() {
                self.policy.remove(user_id);
            }
        }

        if !idle.is_empty() {
            debug!(removed = idle.len(), remaining = sessions.len(), "Cleaned up idle sessions");
        }
        idle.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub async fn recent_events(&self, user_id: &str) -> Vec<RawEvent> {
        let slot = self.sessions.read().get(user_id).cloned();
        match slot {
            Some(slot) => slot.lock().await.recent.iter().cloned().collect(),
            None => Vec::new(),
        }
    }
}

fn elapsed_ms(clock: Instant) -> f64 {
    clock.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amas::modeling::FlowState;
    use crate::db::memory::MemoryRepository;

    fn online_loop(config: AMASConfig) -> OnlineLoop {
        OnlineLoop::new(
            Arc::new(config),
            Arc::new(DecisionPolicy::default()),
            Arc::new(AmasMetrics::new()),
        )
    }

    fn event(correct: bool, rt: i64, ts: i64) -> RawEvent {
        RawEvent {
            is_correct: correct,
            response_time: rt,
            timestamp: ts,
            ..RawEvent::default()
        }
    }

    #[tokio::test]
    async fn decision_comes_from_action_space() {
        let config = AMASConfig::default();
        let actions = config.action_space.clone();
        let online = online_loop(config);

        let result = online
            .process("u1", event(true, 2500, 1_000), None, ProcessContext::default())
            .await;

        assert_eq!(result.decision.source, DecisionSource::Online);
        let index = result.decision.action_index.unwrap();
        assert_eq!(actions[index], result.decision.action);
        assert!((0.4..=1.0).contains(&result.decision.confidence));
        assert!((result.elapsed_ms - result.timings.total()).abs() < 1e-12);
    }

    #[tokio::test]
    async fn empty_action_space_falls_back() {
        let config = AMASConfig {
            action_space: Vec::new(),
            ..AMASConfig::default()
        };
        let metrics = Arc::new(AmasMetrics::new());
        let online = OnlineLoop::new(Arc::new(config), Arc::new(DecisionPolicy::default()), metrics.clone());

        let result = online
            .process("u1", event(true, 2500, 1_000), None, ProcessContext::default())
            .await;

        assert_eq!(result.decision.source, DecisionSource::Fallback);
        assert_eq!(result.decision.action, Action::default());
        assert_eq!(result.decision.confidence, 0.0);
        assert_eq!(metrics.snapshot().fallback_decisions, 1);
    }

    #[tokio::test]
    async fn recent_window_is_bounded() {
        let mut config = AMASConfig::default();
        config.online.recent_window = 3;
        let online = online_loop(config);

        for i in 0..5 {
            online
                .process("u1", event(true, 2000, i * 1000), None, ProcessContext::default())
                .await;
        }

        let recent = online.recent_events("u1").await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].timestamp, 2000);
    }

    #[tokio::test]
    async fn detectors_need_minimum_events() {
        let online = online_loop(AMASConfig::default());
        let result = online
            .process("u1", event(true, 2500, 0), None, ProcessContext::default())
            .await;

        let flow = result.flow.unwrap();
        assert_eq!(flow.state, FlowState::Normal);
        assert_eq!(flow.score, 0.5);
    }

    #[tokio::test]
    async fn confidence_follows_interaction_count() {
        let online = online_loop(AMASConfig::default());
        let ctx = ProcessContext {
            interaction_count: Some(120),
            ..ProcessContext::default()
        };
        let result = online.process("u1", event(true, 2500, 0), None, ctx).await;
        assert!(result.updated_state.conf >= 0.8);
    }

    #[tokio::test]
    async fn state_is_loaded_and_saved_through_repository() {
        let repository = Arc::new(MemoryRepository::new());
        let stored = UserState {
            fatigue: 0.4,
            ts: 0,
            ..UserState::default()
        };
        repository.save_state("u1", &stored).await.unwrap();

        let online = online_loop(AMASConfig::default()).with_repository(repository.clone());
        let result = online
            .process("u1", event(true, 2500, 10_000), None, ProcessContext::default())
            .await;

        let saved = repository.load_state("u1").await.unwrap().unwrap();
        assert_eq!(saved, result.updated_state);
        assert_eq!(saved.ts, 10_000);
    }

    #[tokio::test]
    async fn reward_is_queued_with_decision_context() {
        let aggregator = Arc::new(DelayedRewardAggregator::new(
            AMASConfig::default().delayed_reward.schedule,
        ).unwrap());
        let online = online_loop(AMASConfig::default()).with_aggregator(aggregator.clone());

        let result = online
            .process("u1", event(true, 2500, 5_000), None, ProcessContext::default())
            .await;

        assert_eq!(aggregator.pending_for_user("u1"), 1);
        let matured = aggregator.drain_matured(5_000, 10);
        assert_eq!(matured.len(), 1);
        let context = matured[0].context.clone().unwrap();
        assert_eq!(context.action_index, result.decision.action_index);
        assert_eq!(context.decision_id.as_deref(), Some(result.decision.decision_id.as_str()));
    }

    #[tokio::test]
    async fn reset_user_forgets_session_and_model() {
        let online = online_loop(AMASConfig::default());
        online
            .process("u1", event(true, 2500, 0), None, ProcessContext::default())
            .await;
        assert_eq!(online.session_count(), 1);
        assert!(online.policy().contains("u1"));

        assert!(online.reset_user("u1").await);
        assert_eq!(online.session_count(), 0);
        assert!(!online.policy().contains("u1"));
        assert!(!online.reset_user("u1").await);
    }

    #[tokio::test]
    async fn reset_user_does_not_reload_the_persisted_model() {
        let repository = Arc::new(MemoryRepository::new());
        let online = online_loop(AMASConfig::default()).with_repository(repository.clone());
        let chosen = online
            .process("u1", event(true, 2500, 0), None, ProcessContext::default())
            .await;
        let context = chosen.decision.context_vector.unwrap();
        assert!(online.policy().update("u1", &context, 1.0));
        let model = online.policy().snapshot("u1").unwrap();
        repository.save_model("u1", &model).await.unwrap();

        assert!(online.reset_user("u1").await);
        assert!(repository.load_model("u1").await.unwrap().is_none());

        online
            .process("u1", event(true, 2500, 1000), None, ProcessContext::default())
            .await;
        assert_eq!(online.policy().snapshot("u1").unwrap().update_count, 0);
    }

    #[tokio::test]
    async fn cleanup_keeps_recent_sessions() {
        let online = online_loop(AMASConfig::default());
        online
            .process("u1", event(true, 2500, 0), None, ProcessContext::default())
            .await;

        assert_eq!(online.cleanup_inactive(60_000), 0);
        assert_eq!(online.cleanup_inactive(-1), 1);
        assert_eq!(online.session_count(), 0);
    }
}
