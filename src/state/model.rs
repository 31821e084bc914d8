use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Slow-moving cognitive traits, each in [0,1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CognitiveProfile {
    pub mem: f64,
    pub speed: f64,
    pub stability: f64,
}

impl Default for CognitiveProfile {
    fn default() -> Self {
        Self {
            mem: 0.5,
            speed: 0.5,
            stability: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Flat,
    Stuck,
    Down,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Up => "up",
            Trend::Flat => "flat",
            Trend::Stuck => "stuck",
            Trend::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "up" => Trend::Up,
            "stuck" => Trend::Stuck,
            "down" => Trend::Down,
            _ => Trend::Flat,
        }
    }
}

/// Live cognitive state for one user.
///
/// Invariants:
/// - every scalar is clamped to [0,1]
/// - exactly one live row per user
/// - mutated only by the decision pipeline under the per-user lock
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    pub user_id: String,
    pub attention: f64,
    pub fatigue: f64,
    pub motivation: f64,
    pub cognitive: CognitiveProfile,
    pub trend: Trend,
    pub interaction_count: u64,
    pub updated_ms: u64,
}

impl UserState {
    /// First-event defaults.
    pub fn initial(user_id: impl Into<String>, now_ms: u64) -> Self {
        Self {
            user_id: user_id.into(),
            attention: 0.7,
            fatigue: 0.2,
            motivation: 0.6,
            cognitive: CognitiveProfile::default(),
            trend: Trend::Flat,
            interaction_count: 0,
            updated_ms: now_ms,
        }
    }

    pub fn clamp_all(&mut self) {
        self.attention = self.attention.clamp(0.0, 1.0);
        self.fatigue = self.fatigue.clamp(0.0, 1.0);
        self.motivation = self.motivation.clamp(0.0, 1.0);
        self.cognitive.mem = self.cognitive.mem.clamp(0.0, 1.0);
        self.cognitive.speed = self.cognitive.speed.clamp(0.0, 1.0);
        self.cognitive.stability = self.cognitive.stability.clamp(0.0, 1.0);
    }
}

/// One row of the daily EMA rollup.
#[derive(Clone, Debug, PartialEq)]
pub struct StateSnapshot {
    pub user_id: String,
    pub date: NaiveDate,
    pub attention: f64,
    pub fatigue: f64,
    pub motivation: f64,
    pub mem: f64,
    pub speed: f64,
    pub stability: f64,
    pub trend: Trend,
}

/// One persisted answer; feeds interaction counts and recent accuracy.
#[derive(Clone, Debug)]
pub struct AnswerRecord {
    pub id: String,
    pub user_id: String,
    pub word_id: String,
    pub is_correct: bool,
    pub response_time_ms: u64,
    pub timestamp_ms: u64,
}

/// Per-word learning state; read by the delayed-reward due computation.
#[derive(Clone, Debug)]
pub struct WordState {
    pub user_id: String,
    pub word_id: String,
    pub interval_days: f64,
    pub next_review_ms: Option<u64>,
    pub reps: u32,
    pub lapses: u32,
    pub mastery: f64,
}

impl WordState {
    pub fn fresh(user_id: impl Into<String>, word_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            word_id: word_id.into(),
            interval_days: 0.0,
            next_review_ms: None,
            reps: 0,
            lapses: 0,
            mastery: 0.0,
        }
    }
}

/// Derived per-user statistics for one decision.
#[derive(Clone, Copy, Debug, Default)]
pub struct UserStats {
    pub interaction_count: u64,
    /// Accuracy over the last 20 answers; absent for brand-new users.
    pub recent_accuracy: Option<f64>,
}

/// A single raw interaction event as received from ingress.
#[derive(Clone, Debug, Deserialize)]
pub struct RawEvent {
    pub word_id: String,
    pub is_correct: bool,
    pub response_time_ms: u64,
    #[serde(default)]
    pub dwell_time_ms: u64,
    #[serde(default)]
    pub pause_count: u32,
    #[serde(default)]
    pub switch_count: u32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub focus_loss_ms: u64,
    pub interaction_density: f64,
    pub timestamp_ms: u64,
}

/// Acceptable clock skew for incoming events.
const MAX_EVENT_AGE_MS: u64 = 24 * 3_600_000;
const MAX_EVENT_AHEAD_MS: u64 = 3_600_000;

impl RawEvent {
    /// Caller-contract validation; violations are never retried.
    pub fn validate(&self, now_ms: u64) -> Result<(), AppError> {
        if self.word_id.is_empty() {
            return Err(AppError::invalid("word_id must not be empty"));
        }
        if self.response_time_ms == 0 {
            return Err(AppError::invalid("response_time_ms must be positive"));
        }
        if !(self.interaction_density.is_finite() && self.interaction_density > 0.0) {
            return Err(AppError::invalid("interaction_density must be positive"));
        }
        if self.timestamp_ms + MAX_EVENT_AGE_MS < now_ms {
            return Err(AppError::invalid("event timestamp older than 24h"));
        }
        if self.timestamp_ms > now_ms + MAX_EVENT_AHEAD_MS {
            return Err(AppError::invalid("event timestamp more than 1h ahead"));
        }
        Ok(())
    }
}
