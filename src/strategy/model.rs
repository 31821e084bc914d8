use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Mid,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Mid => "mid",
            Difficulty::Hard => "hard",
        }
    }
}

pub const MAX_BATCH_SIZE: u32 = 20;
pub const MAX_HINT_LEVEL: u32 = 3;

/// Concrete learning strategy emitted per event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyParams {
    pub interval_scale: f64,
    pub new_ratio: f64,
    pub difficulty: Difficulty,
    pub batch_size: u32,
    pub hint_level: u32,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            interval_scale: 1.0,
            new_ratio: 0.2,
            difficulty: Difficulty::Mid,
            batch_size: 8,
            hint_level: 1,
        }
    }
}

impl StrategyParams {
    /// Pins every field into its documented range.
    pub fn constrained(mut self) -> Self {
        self.interval_scale = self.interval_scale.max(0.1);
        self.new_ratio = self.new_ratio.clamp(0.0, 1.0);
        self.batch_size = self.batch_size.clamp(1, MAX_BATCH_SIZE);
        self.hint_level = self.hint_level.min(MAX_HINT_LEVEL);
        self
    }
}

/// The discrete action grid the selector chooses from:
/// three difficulties crossed with three pacing intensities.
pub const ACTION_COUNT: usize = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ActionId(pub usize);

impl ActionId {
    pub fn label(&self) -> String {
        let params = action_params(*self);
        let pace = match self.0 % 3 {
            0 => "gentle",
            1 => "steady",
            _ => "pushy",
        };
        format!("{}_{}", params.difficulty.as_str(), pace)
    }
}

/// Maps a grid cell to its strategy parameters.
pub fn action_params(action: ActionId) -> StrategyParams {
    let difficulty = match action.0 / 3 {
        0 => Difficulty::Easy,
        1 => Difficulty::Mid,
        _ => Difficulty::Hard,
    };

    // Pacing axis: review-heavy and hinted at 0, denser and bare at 2.
    let (interval_scale, new_ratio, batch_size, hint_level) = match action.0 % 3 {
        0 => (0.8, 0.1, 5, 2),
        1 => (1.0, 0.2, 8, 1),
        _ => (1.2, 0.35, 12, 0),
    };

    StrategyParams {
        interval_scale,
        new_ratio,
        difficulty,
        batch_size,
        hint_level,
    }
    .constrained()
}

/// Output of one `predict` call.
#[derive(Clone, Debug)]
pub struct Decision {
    pub action: ActionId,
    pub params: StrategyParams,
    pub confidence: f64,
    /// Per-action score snapshot at decision time, keyed by action label.
    pub weights_snapshot: Vec<(String, f64)>,
}

impl Decision {
    pub fn weights_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.weights_snapshot
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        serde_json::Number::from_f64(*v)
                            .map(serde_json::Value::Number)
                            .unwrap_or(serde_json::Value::Null),
                    )
                })
                .collect(),
        )
    }
}
