//! Gaussian-process Bayesian optimization over a small bounded parameter space.

use std::collections::{BTreeMap, HashSet};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::amas::config::OptimizerConfig;
use crate::amas::decision::matrix::{cholesky_decompose, dot, solve_cholesky, solve_triangular_lower};

const PERTURBATION_SCALE: f64 = 0.05;
const MIN_STD: f64 = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum OptimizerError {
    #[error("parameter space is empty")]
    EmptySpace,
    #[error("parameter {name} has invalid bounds [{min}, {max}]")]
    InvalidBound { name: String, min: f64, max: f64 },
    #[error("duplicate parameter name {0}")]
    DuplicateParam(String),
    #[error("expected {expected} parameters, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("non-finite value for {0}")]
    NonFinite(String),
    #[error("{name}={value} is outside [{min}, {max}]")]
    OutOfBounds {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamBound {
    pub name: String,
    pub min: f64,
    pub max: f64,
}

impl ParamBound {
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
        }
    }

    fn normalize(&self, value: f64) -> f64 {
        (value - self.min) / (self.max - self.min)
    }

    fn denormalize(&self, unit: f64) -> f64 {
        (self.min + unit.clamp(0.0, 1.0) * (self.max - self.min)).clamp(self.min, self.max)
    }
}

pub fn validate_space(space: &[ParamBound]) -> Result<(), OptimizerError> {
    if space.is_empty() {
        return Err(OptimizerError::EmptySpace);
    }
    let mut names = HashSet::with_capacity(space.len());
    for bound in space {
        if !bound.min.is_finite() || !bound.max.is_finite() || bound.min >= bound.max {
            return Err(OptimizerError::InvalidBound {
                name: bound.name.clone(),
                min: bound.min,
                max: bound.max,
            });
        }
        if !names.insert(bound.name.as_str()) {
            return Err(OptimizerError::DuplicateParam(bound.name.clone()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub params: Vec<f64>,
    pub value: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerState {
    pub observations: Vec<Observation>,
    /// Cached index of the best observation. Rebuilt on restore.
    pub best_index: Option<usize>,
}

/// Posterior of the surrogate at one point, in the units of observed values.
#[derive(Debug, Clone, Copy)]
pub struct Posterior {
    pub mean: f64,
    pub std: f64,
}

struct Surrogate {
    train: Vec<Vec<f64>>,
    l: Vec<f64>,
    alpha: Vec<f64>,
    y_mean: f64,
    y_std: f64,
}

pub struct BayesianOptimizer {
    space: Vec<ParamBound>,
    config: OptimizerConfig,
    observations: Vec<Observation>,
    best_index: Option<usize>,
    rng: ChaCha8Rng,
}

impl BayesianOptimizer {
    pub fn new(config: OptimizerConfig) -> Result<Self, OptimizerError> {
        validate_space(&config.params)?;
        Ok(Self {
            space: config.params.clone(),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            observations: Vec::new(),
            best_index: None,
        })
    }

    pub fn space(&self) -> &[ParamBound] {
        &self.space
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn evaluation_count(&self) -> usize {
        self.observations.len()
    }

    pub fn best(&self) -> Option<&Observation> {
        self.best_index.and_then(|i| self.observations.get(i))
    }

    pub fn params_map(&self, params: &[f64]) -> BTreeMap<String, f64> {
        self.space
            .iter()
            .zip(params.iter())
            .map(|(bound, value)| (bound.name.clone(), *value))
            .collect()
    }

    /// Next point to evaluate, in parameter units.
    pub fn suggest_next(&mut self) -> Vec<f64> {
        if self.observations.len() < self.config.initial_samples.max(1) {
            return self.random_point();
        }
        let Some(surrogate) = self.fit() else {
            tracing::debug!("Surrogate fit failed, sampling randomly");
            return self.random_point();
        };

        let n = self.space.len();
        let mut candidates: Vec<Vec<f64>> = (0..self.config.candidate_count)
            .map(|_| (0..n).map(|_| self.rng.random::<f64>()).collect())
            .collect();
        if let Some(best) = self.best().map(|o| self.normalize(&o.params)) {
            for _ in 0..(self.config.candidate_count / 4).max(1) {
                let perturbed = best
                    .iter()
                    .map(|v| {
                        let noise = self.rng.random_range(-PERTURBATION_SCALE..PERTURBATION_SCALE);
                        (v + noise).clamp(0.0, 1.0)
                    })
                    .collect();
                candidates.push(perturbed);
            }
        }

        let beta = self.config.beta;
        let mut chosen: Option<(f64, &Vec<f64>)> = None;
        for candidate in &candidates {
            let posterior = self.predict_with(&surrogate, candidate);
            let acquisition = posterior.mean + beta * posterior.std;
            if !acquisition.is_finite() {
                continue;
            }
            if chosen.map_or(true, |(current, _)| acquisition > current) {
                chosen = Some((acquisition, candidate));
            }
        }

        match chosen {
            Some((_, unit)) => self.denormalize(unit),
            None => self.random_point(),
        }
    }

    /// Posterior of the current surrogate at `params`, or `None` before any
    /// observation exists.
    pub fn predict(&self, params: &[f64]) -> Option<Posterior> {
        let surrogate = self.fit()?;
        Some(self.predict_with(&surrogate, &self.normalize(params)))
    }

    pub fn record_evaluation(
        &mut self,
        params: &[f64],
        value: f64,
        timestamp: i64,
    ) -> Result<(), OptimizerError> {
        self.check_params(params)?;
        if !value.is_finite() {
            return Err(OptimizerError::NonFinite("value".to_string()));
        }

        self.observations.push(Observation {
            params: params.to_vec(),
            value,
            timestamp,
        });
        let index = self.observations.len() - 1;
        if self.best().map_or(true, |best| value > best.value) {
            self.best_index = Some(index);
        }
        Ok(())
    }

    /// Recomputes the cached best by replaying observations in order. Ties
    /// keep the earliest.
    pub fn recompute_best(&mut self) {
        let mut best: Option<(usize, f64)> = None;
        for (i, obs) in self.observations.iter().enumerate() {
            if best.map_or(true, |(_, v)| obs.value > v) {
                best = Some((i, obs.value));
            }
        }
        self.best_index = best.map(|(i, _)| i);
    }

    pub fn get_state(&self) -> OptimizerState {
        OptimizerState {
            observations: self.observations.clone(),
            best_index: self.best_index,
        }
    }

    pub fn set_state(&mut self, state: OptimizerState) -> Result<(), OptimizerError> {
        for obs in &state.observations {
            self.check_params(&obs.params)?;
            if !obs.value.is_finite() {
                return Err(OptimizerError::NonFinite("value".to_string()));
            }
        }
        self.observations = state.observations;
        self.recompute_best();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.observations.clear();
        self.best_index = None;
        self.rng = ChaCha8Rng::seed_from_u64(self.config.seed);
    }

    fn check_params(&self, params: &[f64]) -> Result<(), OptimizerError> {
        if params.len() != self.space.len() {
            return Err(OptimizerError::DimensionMismatch {
                expected: self.space.len(),
                actual: params.len(),
            });
        }
        for (bound, value) in self.space.iter().zip(params.iter()) {
            if !value.is_finite() {
                return Err(OptimizerError::NonFinite(bound.name.clone()));
            }
            if *value < bound.min || *value > bound.max {
                return Err(OptimizerError::OutOfBounds {
                    name: bound.name.clone(),
                    value: *value,
                    min: bound.min,
                    max: bound.max,
                });
            }
        }
        Ok(())
    }

    fn random_point(&mut self) -> Vec<f64> {
        let unit: Vec<f64> = (0..self.space.len())
            .map(|_| self.rng.random::<f64>())
            .collect();
        self.denormalize(&unit)
    }

    fn normalize(&self, params: &[f64]) -> Vec<f64> {
        self.space
            .iter()
            .zip(params.iter())
            .map(|(bound, v)| bound.normalize(*v))
            .collect()
    }

    fn denormalize(&self, unit: &[f64]) -> Vec<f64> {
        self.space
            .iter()
            .zip(unit.iter())
            .map(|(bound, u)| bound.denormalize(*u))
            .collect()
    }

    fn kernel(&self, a: &[f64], b: &[f64]) -> f64 {
        let sq_dist: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
        let ls = self.config.length_scale;
        (-sq_dist / (2.0 * ls * ls)).exp()
    }

    fn fit(&self) -> Option<Surrogate> {
        let n = self.observations.len();
        if n == 0 {
            return None;
        }
        let train: Vec<Vec<f64>> = self
            .observations
            .iter()
            .map(|o| self.normalize(&o.params))
            .collect();
        let values: Vec<f64> = self.observations.iter().map(|o| o.value).collect();
        let y_mean = values.iter().sum::<f64>() / n as f64;
        let variance = values.iter().map(|v| (v - y_mean).powi(2)).sum::<f64>() / n as f64;
        let y_std = if variance.sqrt() > MIN_STD {
            variance.sqrt()
        } else {
            1.0
        };
        let y: Vec<f64> = values.iter().map(|v| (v - y_mean) / y_std).collect();

        let noise = self.config.noise.max(MIN_STD);
        let mut k = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                k[i * n + j] = self.kernel(&train[i], &train[j]);
            }
            k[i * n + i] += noise;
        }
        let l = cholesky_decompose(&k, n, noise);
        let alpha = solve_cholesky(&l, &y, n);
        if alpha.iter().any(|v| !v.is_finite()) {
            return None;
        }

        Some(Surrogate {
            train,
            l,
            alpha,
            y_mean,
            y_std,
        })
    }

    fn predict_with(&self, surrogate: &Surrogate, unit: &[f64]) -> Posterior {
        let n = surrogate.train.len();
        let k_star: Vec<f64> = surrogate
            .train
            .iter()
            .map(|t| self.kernel(t, unit))
            .collect();
        let mean = dot(&k_star, &surrogate.alpha);
        let v = solve_triangular_lower(&surrogate.l, &k_star, n);
        let variance = (1.0 - dot(&v, &v)).max(0.0);

        Posterior {
            mean: surrogate.y_mean + mean * surrogate.y_std,
            std: variance.sqrt() * surrogate.y_std,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OptimizerConfig {
        OptimizerConfig {
            params: vec![ParamBound::new("x", 0.0, 1.0), ParamBound::new("y", -1.0, 1.0)],
            initial_samples: 4,
            candidate_count: 128,
            ..OptimizerConfig::default()
        }
    }

    fn objective(p: &[f64]) -> f64 {
        -((p[0] - 0.7).powi(2) + (p[1] - 0.2).powi(2))
    }

    #[test]
    fn space_validation() {
        assert_eq!(validate_space(&[]), Err(OptimizerError::EmptySpace));
        assert!(matches!(
            validate_space(&[ParamBound::new("a", 1.0, 1.0)]),
            Err(OptimizerError::InvalidBound { .. })
        ));
        assert!(matches!(
            validate_space(&[ParamBound::new("a", 0.0, 1.0), ParamBound::new("a", 0.0, 2.0)]),
            Err(OptimizerError::DuplicateParam(_))
        ));
    }

    #[test]
    fn suggestions_stay_in_bounds() {
        let mut opt = BayesianOptimizer::new(config()).unwrap();
        for i in 0..12 {
            let p = opt.suggest_next();
            assert!((0.0..=1.0).contains(&p[0]));
            assert!((-1.0..=1.0).contains(&p[1]));
            opt.record_evaluation(&p, objective(&p), i).unwrap();
        }
        assert_eq!(opt.evaluation_count(), 12);
    }

    #[test]
    fn out_of_bounds_is_rejected_not_clamped() {
        let mut opt = BayesianOptimizer::new(config()).unwrap();
        let err = opt.record_evaluation(&[1.5, 0.0], 1.0, 0).unwrap_err();
        assert!(matches!(err, OptimizerError::OutOfBounds { .. }));
        assert!(opt.record_evaluation(&[0.5], 1.0, 0).is_err());
        assert!(opt.record_evaluation(&[0.5, 0.0], f64::NAN, 0).is_err());
        assert_eq!(opt.evaluation_count(), 0);
    }

    #[test]
    fn best_only_moves_on_strict_improvement() {
        let mut opt = BayesianOptimizer::new(config()).unwrap();
        opt.record_evaluation(&[0.1, 0.0], 0.5, 0).unwrap();
        opt.record_evaluation(&[0.2, 0.0], 0.5, 1).unwrap();
        assert_eq!(opt.best().unwrap().params, vec![0.1, 0.0]);
        opt.record_evaluation(&[0.3, 0.0], 0.6, 2).unwrap();
        assert_eq!(opt.best().unwrap().value, 0.6);
        opt.record_evaluation(&[0.4, 0.0], 0.1, 3).unwrap();
        assert_eq!(opt.best().unwrap().value, 0.6);
    }

    #[test]
    fn state_restore_rebuilds_best() {
        let mut opt = BayesianOptimizer::new(config()).unwrap();
        opt.record_evaluation(&[0.1, 0.0], 0.2, 0).unwrap();
        opt.record_evaluation(&[0.9, 0.5], 0.8, 1).unwrap();
        let mut state = opt.get_state();
        state.best_index = Some(0);

        let mut restored = BayesianOptimizer::new(config()).unwrap();
        restored.set_state(state).unwrap();
        assert_eq!(restored.best().unwrap().value, 0.8);

        restored.reset();
        assert!(restored.best().is_none());
        assert_eq!(restored.evaluation_count(), 0);
    }

    #[test]
    fn surrogate_interpolates_observations() {
        let mut opt = BayesianOptimizer::new(config()).unwrap();
        opt.record_evaluation(&[0.2, 0.0], 0.1, 0).unwrap();
        opt.record_evaluation(&[0.8, 0.0], 0.9, 1).unwrap();
        let near_high = opt.predict(&[0.8, 0.0]).unwrap();
        let near_low = opt.predict(&[0.2, 0.0]).unwrap();
        assert!(near_high.mean > near_low.mean);
        assert!(near_high.std < 0.1);
    }

    #[test]
    fn same_seed_gives_same_suggestions() {
        let mut a = BayesianOptimizer::new(config()).unwrap();
        let mut b = BayesianOptimizer::new(config()).unwrap();
        assert_eq!(a.suggest_next(), b.suggest_next());
    }

    #[test]
    fn upper_edge_of_an_inexact_range_stays_in_bounds() {
        let bound = ParamBound::new("fatigue_k", 0.03, 0.3);
        assert_eq!(bound.denormalize(1.0), 0.3);
        assert_eq!(bound.denormalize(0.0), 0.03);

        let mut optimizer = BayesianOptimizer::new(OptimizerConfig {
            params: vec![bound.clone()],
            ..config()
        })
        .unwrap();
        let edge = vec![bound.denormalize(1.0)];
        optimizer.record_evaluation(&edge, 1.0, 0).unwrap();
        assert_eq!(optimizer.evaluation_count(), 1);
    }
}
