use serde::{Deserialize, Serialize};

/// Cold-start phase boundaries, in cumulative interactions.
#[derive(Clone, Copy, Debug)]
pub struct PhaseThresholds {
    pub classify_until: u64,
    pub explore_until: u64,
}

impl Default for PhaseThresholds {
    fn default() -> Self {
        Self {
            classify_until: 15,
            explore_until: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColdStartPhase {
    Classify,
    Explore,
    Normal,
}

impl ColdStartPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColdStartPhase::Classify => "classify",
            ColdStartPhase::Explore => "explore",
            ColdStartPhase::Normal => "normal",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ColdStartPhase::Classify => "learning the user's baseline",
            ColdStartPhase::Explore => "trying alternative strategies",
            ColdStartPhase::Normal => "exploiting the fitted model",
        }
    }
}

/// Pure function of the cumulative interaction count.
pub fn phase_for(interaction_count: u64, thresholds: &PhaseThresholds) -> ColdStartPhase {
    if interaction_count < thresholds.classify_until {
        ColdStartPhase::Classify
    } else if interaction_count < thresholds.explore_until {
        ColdStartPhase::Explore
    } else {
        ColdStartPhase::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_boundaries() {
        let t = PhaseThresholds::default();
        assert_eq!(phase_for(0, &t), ColdStartPhase::Classify);
        assert_eq!(phase_for(14, &t), ColdStartPhase::Classify);
        assert_eq!(phase_for(15, &t), ColdStartPhase::Explore);
        assert_eq!(phase_for(29, &t), ColdStartPhase::Explore);
        assert_eq!(phase_for(30, &t), ColdStartPhase::Normal);
        assert_eq!(phase_for(10_000, &t), ColdStartPhase::Normal);
    }

    #[test]
    fn custom_thresholds_shift_the_boundaries() {
        let t = PhaseThresholds {
            classify_until: 2,
            explore_until: 4,
        };
        assert_eq!(phase_for(1, &t), ColdStartPhase::Classify);
        assert_eq!(phase_for(2, &t), ColdStartPhase::Explore);
        assert_eq!(phase_for(4, &t), ColdStartPhase::Normal);
    }
}
