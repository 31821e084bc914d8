//! Linear contextual bandit over the discrete action grid.
//!
//! One weight vector (plus bias) per action; prediction is a dot product,
//! learning is stochastic gradient toward the observed reward. Exploration
//! is phase-dependent: seeded-uniform while classifying, ε-greedy while
//! exploring, greedy with a count-based bonus afterwards.
//!
//! Determinism: the RNG is seeded and lives inside the model state, so the
//! same state and inputs always produce the same decision.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::AppError;
use crate::features::model::FeatureVector;
use crate::strategy::model::{ACTION_COUNT, ActionId, Decision, action_params};
use crate::strategy::phase::ColdStartPhase;
use crate::strategy::selector::StrategySelector;

/// Processed delayed-reward keys retained for duplicate detection.
const PROCESSED_KEY_CAP: usize = 4_096;

pub struct LinearBandit {
    epsilon: f64,
    exploration_bonus: f64,
    learning_rate: f64,
    inner: Mutex<BanditState>,
}

struct BanditState {
    dim: usize,
    /// `ACTION_COUNT` rows of `dim + 1` weights; the last entry is the bias.
    weights: Vec<Vec<f64>>,
    pulls: Vec<u64>,
    total_pulls: u64,
    rng: ChaCha8Rng,
    processed: HashSet<String>,
    processed_order: VecDeque<String>,
}

impl LinearBandit {
    pub fn new(dim: usize, seed: u64) -> Self {
        Self {
            epsilon: 0.1,
            exploration_bonus: 0.05,
            learning_rate: 0.1,
            inner: Mutex::new(BanditState {
                dim,
                weights: vec![vec![0.0; dim + 1]; ACTION_COUNT],
                pulls: vec![0; ACTION_COUNT],
                total_pulls: 0,
                rng: ChaCha8Rng::seed_from_u64(seed),
                processed: HashSet::new(),
                processed_order: VecDeque::new(),
            }),
        }
    }

    fn score(state: &BanditState, action: usize, values: &[f64]) -> f64 {
        let w = &state.weights[action];
        let mut s = w[state.dim]; // bias
        for i in 0..state.dim {
            s += w[i] * values.get(i).copied().unwrap_or(0.0);
        }
        s
    }

    fn scores(state: &BanditState, values: &[f64]) -> Vec<f64> {
        (0..ACTION_COUNT)
            .map(|a| Self::score(state, a, values))
            .collect()
    }

    fn argmax(scores: &[f64]) -> usize {
        let mut best = 0;
        for (i, s) in scores.iter().enumerate() {
            if *s > scores[best] {
                best = i;
            }
        }
        best
    }

    /// Confidence from the margin between the best and runner-up score.
    fn confidence(scores: &[f64], chosen: usize) -> f64 {
        let best = scores[chosen];
        let second = scores
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != chosen)
            .map(|(_, s)| *s)
            .fold(f64::NEG_INFINITY, f64::max);
        let gap = best - second;
        1.0 / (1.0 + (-gap).exp())
    }

    fn apply_update(state: &mut BanditState, action: usize, values: &[f64], reward: f64, lr: f64) {
        let predicted = Self::score(state, action, values);
        let err = reward - predicted;
        let dim = state.dim;
        let w = &mut state.weights[action];
        for i in 0..dim {
            w[i] += lr * err * values.get(i).copied().unwrap_or(0.0);
        }
        w[dim] += lr * err;
    }

    fn remember_key(state: &mut BanditState, key: &str) {
        state.processed.insert(key.to_string());
        state.processed_order.push_back(key.to_string());
        while state.processed_order.len() > PROCESSED_KEY_CAP {
            if let Some(old) = state.processed_order.pop_front() {
                state.processed.remove(&old);
            }
        }
    }
}

impl StrategySelector for LinearBandit {
    fn predict(&self, features: &FeatureVector, phase: ColdStartPhase) -> Decision {
        let mut state = self.inner.lock();
        let scores = Self::scores(&state, &features.values);

        let chosen = match phase {
            ColdStartPhase::Classify => state.rng.gen_range(0..ACTION_COUNT),
            ColdStartPhase::Explore => {
                if state.rng.gen_bool(self.epsilon) {
                    state.rng.gen_range(0..ACTION_COUNT)
                } else {
                    Self::argmax(&scores)
                }
            }
            ColdStartPhase::Normal => {
                let total = state.total_pulls as f64;
                let bonused: Vec<f64> = scores
                    .iter()
                    .enumerate()
                    .map(|(a, s)| {
                        let bonus = self.exploration_bonus
                            * ((total + 1.0).ln() / (state.pulls[a] as f64 + 1.0)).sqrt();
                        s + bonus
                    })
                    .collect();
                Self::argmax(&bonused)
            }
        };

        state.pulls[chosen] += 1;
        state.total_pulls += 1;

        let confidence = match phase {
            // During classification the choice carries no model signal.
            ColdStartPhase::Classify => 1.0 / ACTION_COUNT as f64,
            _ => Self::confidence(&scores, chosen),
        };

        let weights_snapshot = scores
            .iter()
            .enumerate()
            .map(|(a, s)| (ActionId(a).label(), *s))
            .collect();

        Decision {
            action: ActionId(chosen),
            params: action_params(ActionId(chosen)),
            confidence,
            weights_snapshot,
        }
    }

    fn update_realtime(&self, features: &FeatureVector, action: ActionId, reward: f64) {
        if !reward.is_finite() {
            tracing::warn!(action = action.0, "dropping non-finite realtime reward");
            return;
        }
        let mut state = self.inner.lock();
        Self::apply_update(
            &mut state,
            action.0.min(ACTION_COUNT - 1),
            &features.values,
            reward.clamp(-1.0, 1.0),
            self.learning_rate,
        );
    }

    fn update_delayed(
        &self,
        features: &FeatureVector,
        reward: f64,
        idempotency_key: &str,
    ) -> Result<bool, AppError> {
        if !reward.is_finite() {
            return Err(AppError::invalid("delayed reward must be finite"));
        }
        features.check_shape()?;

        let mut state = self.inner.lock();
        if state.processed.contains(idempotency_key) {
            return Ok(false);
        }

        // The task does not carry the acted-on arm: credit the arm the
        // current model would pick greedily for these features.
        let scores = Self::scores(&state, &features.values);
        let action = Self::argmax(&scores);

        Self::apply_update(
            &mut state,
            action,
            &features.values,
            reward.clamp(-1.0, 1.0),
            self.learning_rate,
        );
        Self::remember_key(&mut state, idempotency_key);
        Ok(true)
    }
}
