use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::amas::config::BanditConfig;
use crate::amas::decision::linucb::{
    cold_start_alpha, ActionSelection, DecisionContext, LinUCBModel, FEATURE_DIMENSION,
};
use crate::amas::types::{Action, BanditModel, UserState};

/// Holds one LinUCB model per user.
///
/// The outer map lock is only held to look up or insert a user's slot; the
/// numeric work runs under that user's own mutex.
pub struct DecisionPolicy {
    config: RwLock<BanditConfig>,
    models: RwLock<HashMap<String, Arc<Mutex<LinUCBModel>>>>,
}

impl DecisionPolicy {
    pub fn new(config: BanditConfig) -> Self {
        Self {
            config: RwLock::new(config),
            models: RwLock::new(HashMap::new()),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.config.read().alpha
    }

    pub fn set_alpha(&self, alpha: f64) {
        if !alpha.is_finite() || alpha < 0.0 {
            tracing::warn!(alpha = alpha, "Ignoring invalid bandit alpha");
            return;
        }
        self.config.write().alpha = alpha;
    }

    fn cold_model(&self) -> LinUCBModel {
        let config = self.config.read();
        LinUCBModel::new(
            FEATURE_DIMENSION,
            config.lambda,
            config.alpha,
            config.full_recompute_interval,
        )
    }

    fn slot(&self, user_id: &str) -> Arc<Mutex<LinUCBModel>> {
        if let Some(slot) = self.models.read().get(user_id) {
            return Arc::clone(slot);
        }
        let cold = self.cold_model();
        let mut models = self.models.write();
        Arc::clone(
            models
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(cold))),
        )
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.models.read().contains_key(user_id)
    }

    pub fn select(
        &self,
        user_id: &str,
        state: &UserState,
        context: &DecisionContext,
        actions: &[Action],
        interaction_count: Option<u64>,
    ) -> Option<ActionSelection> {
        let (base_alpha, boost) = {
            let config = self.config.read();
            (config.alpha, config.cold_start_boost)
        };
        let slot = self.slot(user_id);
        let model = slot.lock();
        let interactions = interaction_count.unwrap_or_else(|| model.update_count());
        let alpha = if boost {
            cold_start_alpha(base_alpha, interactions)
        } else {
            base_alpha
        };
        model.select(state, context, actions, alpha)
    }

    pub fn update(&self, user_id: &str, x: &[f64], reward: f64) -> bool {
        let alpha = self.alpha();
        let slot = self.slot(user_id);
        let mut model = slot.lock();
        model.set_alpha(alpha);
        let applied = model.update(x, reward);
        if !applied {
            tracing::warn!(
                user_id = %user_id,
                dim = x.len(),
                reward = reward,
                "Bandit update rejected"
            );
        }
        applied
    }

    pub fn snapshot(&self, user_id: &str) -> Option<BanditModel> {
        let slot = self.models.read().get(user_id).cloned()?;
        let model = slot.lock();
        Some(model.model().clone())
    }

    pub fn restore(&self, user_id: &str, model: BanditModel) {
        let interval = self.config.read().full_recompute_interval;
        let restored = LinUCBModel::from_model(model, FEATURE_DIMENSION, interval);
        self.models
            .write()
            .insert(user_id.to_string(), Arc::new(Mutex::new(restored)));
    }

    pub fn remove(&self, user_id: &str) -> bool {
        self.models.write().remove(user_id).is_some()
    }

    pub fn user_count(&self) -> usize {
        self.models.read().len()
    }
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self::new(BanditConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amas::config::default_action_space;
    use crate::amas::decision::linucb::build_features;

    #[test]
    fn models_are_isolated_per_user() {
        let policy = DecisionPolicy::default();
        let state = UserState::default();
        let ctx = DecisionContext::default();
        let actions = default_action_space();
        let x = build_features(&state, &ctx, &actions[0]);

        assert!(policy.update("u1", &x, 1.0));
        assert_eq!(policy.snapshot("u1").unwrap().update_count, 1);
        assert!(policy.snapshot("u2").is_none());

        policy.select("u2", &state, &ctx, &actions, None);
        assert_eq!(policy.snapshot("u2").unwrap().update_count, 0);
        assert_eq!(policy.user_count(), 2);
    }

    #[test]
    fn restore_replaces_existing_model() {
        let policy = DecisionPolicy::default();
        let x = vec![0.5; FEATURE_DIMENSION];
        policy.update("u1", &x, 1.0);
        let saved = policy.snapshot("u1").unwrap();

        policy.update("u1", &x, 1.0);
        policy.restore("u1", saved.clone());
        assert_eq!(policy.snapshot("u1").unwrap(), saved);
    }

    #[test]
    fn invalid_alpha_is_ignored() {
        let policy = DecisionPolicy::default();
        policy.set_alpha(-1.0);
        assert_eq!(policy.alpha(), BanditConfig::default().alpha);
        policy.set_alpha(1.25);
        assert_eq!(policy.alpha(), 1.25);
    }
}
