//! Reward and scoring formulas. Fixed by design; changing a weight here
//! changes the model's optimization target.

use crate::state::update::speed_score;

/// Immediate reward weights.
const R_ACCURACY: f64 = 0.5;
const R_SPEED: f64 = 0.3;
const R_STABILITY: f64 = 0.2;

/// `r = 0.5·(2·correct−1) + 0.3·speed + 0.2·Δstability`, clamped to [−1,1].
pub fn immediate_reward(is_correct: bool, speed: f64, stability_delta: f64) -> f64 {
    let accuracy_term = if is_correct { 1.0 } else { -1.0 };
    (R_ACCURACY * accuracy_term + R_SPEED * speed + R_STABILITY * stability_delta).clamp(-1.0, 1.0)
}

/// Word-score weights (percentile-scaled components, 0–100 total).
const W_ACCURACY: f64 = 0.4;
const W_SPEED: f64 = 0.2;
const W_STABILITY: f64 = 0.2;
const W_PROFICIENCY: f64 = 0.2;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreBreakdown {
    pub accuracy: f64,
    pub speed: f64,
    pub stability: f64,
    pub proficiency: f64,
    /// Weighted total, rounded.
    pub total: u32,
}

/// Percentile-scaled 0–100 score for one answer.
pub fn score_event(
    is_correct: bool,
    response_time_ms: u64,
    stability: f64,
    mastery: f64,
) -> ScoreBreakdown {
    let accuracy = if is_correct { 100.0 } else { 0.0 };
    let speed = speed_score(response_time_ms) * 100.0;
    let stability = stability.clamp(0.0, 1.0) * 100.0;
    let proficiency = mastery.clamp(0.0, 1.0) * 100.0;

    let total = (accuracy * W_ACCURACY
        + speed * W_SPEED
        + stability * W_STABILITY
        + proficiency * W_PROFICIENCY)
        .round() as u32;

    ScoreBreakdown {
        accuracy,
        speed,
        stability,
        proficiency,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fast_correct_answer_is_strongly_positive() {
        // correct, 2.5s, no stability change: 0.5 + 0.3·1.0 = 0.8
        let r = immediate_reward(true, 1.0, 0.0);
        assert!((r - 0.8).abs() < 1e-12);
    }

    #[test]
    fn slow_wrong_answer_is_negative() {
        let r = immediate_reward(false, 0.25, -0.05);
        assert!(r < 0.0);
    }

    #[test]
    fn reward_is_clamped() {
        assert_eq!(immediate_reward(true, 1.0, 10.0), 1.0);
        assert_eq!(immediate_reward(false, 0.0, -10.0), -1.0);
    }

    #[test]
    fn score_total_uses_the_fixed_weights() {
        // 100·0.4 + 100·0.2 + 50·0.2 + 0·0.2 = 70
        let s = score_event(true, 2_000, 0.5, 0.0);
        assert_eq!(s.total, 70);
    }

    #[test]
    fn score_total_is_rounded() {
        // 100·0.4 + 75·0.2 + 33·0.2 + 0·0.2 = 61.6 → 62
        let s = score_event(true, 4_000, 0.33, 0.0);
        assert_eq!(s.total, 62);
    }

    proptest! {
        #[test]
        fn reward_always_in_unit_interval(
            correct in proptest::bool::ANY,
            speed in 0.0f64..=1.0,
            delta in -1.0f64..=1.0,
        ) {
            let r = immediate_reward(correct, speed, delta);
            prop_assert!((-1.0..=1.0).contains(&r));
        }

        #[test]
        fn score_total_never_exceeds_100(
            correct in proptest::bool::ANY,
            rt in 1u64..120_000,
            stability in 0.0f64..=1.0,
            mastery in 0.0f64..=1.0,
        ) {
            let s = score_event(correct, rt, stability, mastery);
            prop_assert!(s.total <= 100);
        }
    }
}
