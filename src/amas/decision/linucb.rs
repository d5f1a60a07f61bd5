use serde::{Deserialize, Serialize};

use crate::amas::decision::matrix::{
    cholesky_decompose, cholesky_rank1_update, dot, has_invalid_values, identity_scaled,
    needs_full_recompute, quadratic_form, rank1_update_matrix, sanitize_covariance,
    sanitize_feature_vector, solve_cholesky, vec_add_scaled, MIN_LAMBDA, MIN_RANK1_DIAG,
};
use crate::amas::types::{Action, BanditModel, UserState, ACTION_FEATURE_DIM};

pub const STATE_FEATURE_DIM: usize = 6;
pub const CONTEXT_FEATURE_DIM: usize = 3;
pub const INTERACTION_FEATURE_DIM: usize = 5;
pub const FEATURE_DIMENSION: usize =
    STATE_FEATURE_DIM + CONTEXT_FEATURE_DIM + ACTION_FEATURE_DIM + INTERACTION_FEATURE_DIM + 1;

const RT_NORMALIZER_MS: f64 = 10_000.0;

/// Per-call signals the host provides alongside the event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionContext {
    pub recent_error_rate: f64,
    pub recent_response_time: f64,
    /// Hour of day, 0..=23.
    pub time_bucket: u32,
}

impl Default for DecisionContext {
    fn default() -> Self {
        Self {
            recent_error_rate: 0.0,
            recent_response_time: 3000.0,
            time_bucket: 12,
        }
    }
}

pub fn build_features(state: &UserState, context: &DecisionContext, action: &Action) -> Vec<f64> {
    let motivation = (state.motivation.clamp(-1.0, 1.0) + 1.0) / 2.0;
    let error_rate = context.recent_error_rate.clamp(0.0, 1.0);
    let rt = (context.recent_response_time / RT_NORMALIZER_MS).clamp(0.0, 1.0);
    let hour = context.time_bucket.min(23) as f64 / 23.0;
    let action_features = action.features();
    let difficulty = action_features[0];
    let batch = action_features[2];

    let mut x = Vec::with_capacity(FEATURE_DIMENSION);
    x.extend_from_slice(&[
        state.attention,
        state.fatigue,
        state.cognitive.mem,
        state.cognitive.speed,
        state.cognitive.stability,
        motivation,
    ]);
    x.extend_from_slice(&[error_rate, rt, hour]);
    x.extend_from_slice(&action_features);
    x.extend_from_slice(&[
        state.attention * difficulty,
        state.fatigue * batch,
        state.cognitive.mem * action.new_ratio,
        error_rate * difficulty,
        motivation * action.interval_scale,
    ]);
    x.push(1.0);

    sanitize_feature_vector(&mut x);
    x
}

/// Exploration multiplier for users with little history.
pub fn cold_start_alpha(base_alpha: f64, interaction_count: u64) -> f64 {
    match interaction_count {
        0..=9 => base_alpha * 2.0,
        10..=49 => base_alpha * 1.5,
        50..=199 => base_alpha * 1.2,
        _ => base_alpha,
    }
}

pub fn confidence_from_exploration(exploration: f64) -> f64 {
    (1.0 - 0.3 * exploration).clamp(0.4, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UcbStats {
    pub exploitation: f64,
    pub exploration: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSelection {
    pub index: usize,
    pub action: Action,
    pub features: Vec<f64>,
    pub stats: UcbStats,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct LinUCBModel {
    model: BanditModel,
    recompute_interval: u64,
}

impl LinUCBModel {
    pub fn new(d: usize, lambda: f64, alpha: f64, recompute_interval: u64) -> Self {
        let lambda = lambda.max(MIN_LAMBDA);
        Self {
            model: BanditModel {
                a: identity_scaled(d, lambda),
                b: vec![0.0; d],
                l: identity_scaled(d, lambda.sqrt()),
                lambda,
                alpha,
                d,
                update_count: 0,
            },
            recompute_interval,
        }
    }

    /// Adopts a persisted model. A model of the wrong shape is replaced by a
    /// cold one; a missing or damaged factor is rebuilt from `A`.
    pub fn from_model(model: BanditModel, expected_d: usize, recompute_interval: u64) -> Self {
        let d = model.d;
        if d != expected_d || model.a.len() != d * d || model.b.len() != d {
            tracing::warn!(
                stored_d = d,
                expected_d = expected_d,
                "Discarding bandit model with mismatched dimensions"
            );
            return Self::new(expected_d, model.lambda, model.alpha, recompute_interval);
        }

        let mut this = Self {
            model,
            recompute_interval,
        };
        this.ensure_factor();
        this
    }

    pub fn model(&self) -> &BanditModel {
        &self.model
    }

    pub fn update_count(&self) -> u64 {
        self.model.update_count
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.model.alpha = alpha;
    }

    fn ensure_factor(&mut self) {
        let d = self.model.d;
        let usable = self.model.l.len() == d * d
            && !has_invalid_values(&self.model.l)
            && (0..d).all(|i| self.model.l[i * d + i] >= MIN_RANK1_DIAG);
        if !usable {
            self.recompute_factor();
        }
    }

    fn recompute_factor(&mut self) {
        let d = self.model.d;
        sanitize_covariance(&mut self.model.a, d, self.model.lambda);
        self.model.l = cholesky_decompose(&self.model.a, d, self.model.lambda);
    }

    fn theta(&self) -> Vec<f64> {
        solve_cholesky(&self.model.l, &self.model.b, self.model.d)
    }

    fn stats_with(&self, theta: &[f64], x: &[f64], alpha: f64) -> UcbStats {
        let exploitation = dot(theta, x);
        let exploration = quadratic_form(&self.model.l, x, self.model.d).max(0.0).sqrt();
        UcbStats {
            exploitation,
            exploration,
            score: exploitation + alpha * exploration,
        }
    }

    pub fn score(&self, x: &[f64], alpha: f64) -> Option<UcbStats> {
        if x.len() != self.model.d {
            return None;
        }
        Some(self.stats_with(&self.theta(), x, alpha))
    }

    /// Returns the highest-UCB action. Ties keep the earliest action in `actions`.
    pub fn select(
        &self,
        state: &UserState,
        context: &DecisionContext,
        actions: &[Action],
        alpha: f64,
    ) -> Option<ActionSelection> {
        if actions.is_empty() {
            return None;
        }

        let theta = self.theta();
        let mut best: Option<ActionSelection> = None;

        for (index, action) in actions.iter().enumerate() {
            let x = build_features(state, context, action);
            if x.len() != self.model.d {
                continue;
            }
            let stats = self.stats_with(&theta, &x, alpha);
            if !stats.score.is_finite() {
                continue;
            }
            let better = best
                .as_ref()
                .map_or(true, |current| stats.score > current.stats.score);
            if better {
                best = Some(ActionSelection {
                    index,
                    action: action.clone(),
                    confidence: confidence_from_exploration(stats.exploration),
                    features: x,
                    stats,
                });
            }
        }

        best
    }

    /// Applies `A += xxᵀ`, `b += r·x`. Returns `false` when the sample is rejected.
    pub fn update(&mut self, x: &[f64], reward: f64) -> bool {
        let d = self.model.d;
        if x.len() != d || !reward.is_finite() {
            return false;
        }

        let mut x = x.to_vec();
        sanitize_feature_vector(&mut x);

        rank1_update_matrix(&mut self.model.a, &x, d);
        vec_add_scaled(&mut self.model.b, &x, reward);
        self.model.update_count += 1;

        let incremental_ok = cholesky_rank1_update(&mut self.model.l, &x, d, MIN_RANK1_DIAG);
        if !incremental_ok
            || needs_full_recompute(
                self.model.update_count,
                self.recompute_interval,
                &self.model.l,
                d,
            )
        {
            if !incremental_ok {
                tracing::debug!(
                    update_count = self.model.update_count,
                    "Rank-1 Cholesky update failed, recomputing factor"
                );
            }
            self.recompute_factor();
        }

        true
    }
}
