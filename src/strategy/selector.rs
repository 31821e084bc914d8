use crate::error::AppError;
use crate::features::model::FeatureVector;
use crate::strategy::model::{ActionId, Decision};
use crate::strategy::phase::ColdStartPhase;

/// Polymorphism boundary for the learning model.
///
/// Implementations must be deterministic for a given model state (any
/// internal randomness is part of that state) and must converge
/// monotonically under repeated identical (features, reward) updates.
///
/// `update_delayed` is the at-least-once endpoint of the delayed-reward
/// queue: a repeat call with an already-processed idempotency key must
/// no-op and report `Ok(false)`.
pub trait StrategySelector: Send + Sync {
    fn predict(&self, features: &FeatureVector, phase: ColdStartPhase) -> Decision;

    fn update_realtime(&self, features: &FeatureVector, action: ActionId, reward: f64);

    fn update_delayed(
        &self,
        features: &FeatureVector,
        reward: f64,
        idempotency_key: &str,
    ) -> Result<bool, AppError>;
}
