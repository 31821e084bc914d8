//! Deterministic per-event state update.
//!
//! Everything in this module is a pure function of (previous state, event,
//! derived stats): same inputs always produce byte-identical outputs. No
//! clocks, no randomness, no I/O.

use chrono::NaiveDate;

use crate::state::model::{RawEvent, StateSnapshot, Trend, UserState, UserStats, WordState};

/// EMA weight for repeated same-day rollup writes.
pub const HISTORY_EMA_ALPHA: f64 = 0.3;

/// EMA weight for the slow cognitive traits.
const COGNITIVE_EMA_ALPHA: f64 = 0.1;

/// Response-time bands mapped to a score in {1.0, 0.75, 0.5, 0.25}.
pub fn speed_score(response_time_ms: u64) -> f64 {
    match response_time_ms {
        0..=3_000 => 1.0,
        3_001..=5_000 => 0.75,
        5_001..=10_000 => 0.5,
        _ => 0.25,
    }
}

/// Behavioral engagement in [0,1], penalizing pauses, app switches and
/// focus loss. Each penalty saturates so one noisy signal cannot zero the
/// whole score.
pub fn engagement(event: &RawEvent) -> f64 {
    let pause_penalty = (event.pause_count as f64 * 0.05).min(0.3);
    let switch_penalty = (event.switch_count as f64 * 0.1).min(0.3);
    let focus_penalty = (event.focus_loss_ms as f64 / 30_000.0).min(0.3);
    (1.0 - pause_penalty - switch_penalty - focus_penalty).clamp(0.0, 1.0)
}

/// Answer quality combining correctness and speed.
pub fn quality(event: &RawEvent) -> f64 {
    let accuracy = if event.is_correct { 1.0 } else { 0.0 };
    (accuracy * 0.6 + speed_score(event.response_time_ms) * 0.4).clamp(0.0, 1.0)
}

fn ema(prev: f64, target: f64, alpha: f64) -> f64 {
    prev * (1.0 - alpha) + target * alpha
}

fn trend_of(recent_accuracy: Option<f64>) -> Trend {
    match recent_accuracy {
        None => Trend::Flat,
        Some(a) if a >= 0.7 => Trend::Up,
        Some(a) if a >= 0.45 => Trend::Flat,
        Some(a) if a >= 0.3 => Trend::Stuck,
        _ => Trend::Down,
    }
}

/// Applies one event to the state. All outputs are clamped to [0,1].
pub fn apply_event(
    prev: &UserState,
    event: &RawEvent,
    stats: &UserStats,
    now_ms: u64,
) -> UserState {
    let eng = engagement(event);
    let speed = speed_score(event.response_time_ms);
    let accuracy = if event.is_correct { 1.0 } else { 0.0 };

    // Attention drifts toward observed engagement; fatigue drags it down.
    let attention = prev.attention + 0.1 * (eng - 0.5) - 0.02 * prev.fatigue;

    // Fatigue accrues per event, faster on slow or retried answers.
    let base_fatigue = if event.response_time_ms > 10_000 {
        0.05
    } else {
        0.02
    };
    let fatigue = prev.fatigue + base_fatigue + 0.01 * event.retry_count.min(3) as f64;

    let motivation = if event.is_correct {
        prev.motivation + 0.05
    } else {
        prev.motivation - 0.08
    };

    let mut next = UserState {
        user_id: prev.user_id.clone(),
        attention,
        fatigue,
        motivation,
        cognitive: crate::state::model::CognitiveProfile {
            mem: ema(prev.cognitive.mem, accuracy, COGNITIVE_EMA_ALPHA),
            speed: ema(prev.cognitive.speed, speed, COGNITIVE_EMA_ALPHA),
            stability: ema(prev.cognitive.stability, quality(event), COGNITIVE_EMA_ALPHA),
        },
        trend: trend_of(stats.recent_accuracy),
        interaction_count: prev.interaction_count + 1,
        updated_ms: now_ms,
    };
    next.clamp_all();
    next
}

/// Merges the new state into the day's rollup row.
///
/// The first write of a day copies the state; later writes the same day
/// blend with α = [`HISTORY_EMA_ALPHA`].
pub fn merge_daily(prev: Option<&StateSnapshot>, state: &UserState, date: NaiveDate) -> StateSnapshot {
    match prev {
        None => StateSnapshot {
            user_id: state.user_id.clone(),
            date,
            attention: state.attention,
            fatigue: state.fatigue,
            motivation: state.motivation,
            mem: state.cognitive.mem,
            speed: state.cognitive.speed,
            stability: state.cognitive.stability,
            trend: state.trend,
        },
        Some(p) => StateSnapshot {
            user_id: state.user_id.clone(),
            date,
            attention: ema(p.attention, state.attention, HISTORY_EMA_ALPHA),
            fatigue: ema(p.fatigue, state.fatigue, HISTORY_EMA_ALPHA),
            motivation: ema(p.motivation, state.motivation, HISTORY_EMA_ALPHA),
            mem: ema(p.mem, state.cognitive.mem, HISTORY_EMA_ALPHA),
            speed: ema(p.speed, state.cognitive.speed, HISTORY_EMA_ALPHA),
            stability: ema(p.stability, state.cognitive.stability, HISTORY_EMA_ALPHA),
            trend: state.trend,
        },
    }
}

/// Scored-word update, persisted in the same transaction as the state.
///
/// Correct answers grow the review interval (capped), wrong answers reset
/// it and count a lapse. `next_review_ms` anchors the delayed-reward due
/// time.
pub fn update_word(prev: Option<WordState>, event: &RawEvent, user_id: &str, now_ms: u64) -> WordState {
    let mut w = prev.unwrap_or_else(|| WordState::fresh(user_id, &event.word_id));
    w.reps += 1;

    if event.is_correct {
        w.interval_days = if w.interval_days <= 0.0 {
            1.0
        } else {
            (w.interval_days * 2.0).min(60.0)
        };
        w.mastery = ema(w.mastery, quality(event), 0.3);
    } else {
        w.lapses += 1;
        w.interval_days = 0.0;
        w.mastery = ema(w.mastery, 0.0, 0.3);
    }

    w.next_review_ms = if w.interval_days > 0.0 {
        Some(now_ms + (w.interval_days * 86_400_000.0) as u64)
    } else {
        None
    };
    w
}
