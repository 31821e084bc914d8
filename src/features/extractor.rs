use crate::features::model::{FEATURE_LABELS, FEATURE_VERSION, FeatureVector, NORM_METHOD};
use crate::state::model::{RawEvent, UserState, UserStats};
use crate::state::update::{engagement, speed_score};

/// Vectorizes one event plus the post-update state into the fixed v2
/// schema. Pure function; every value lands in [0,1].
pub fn extract(
    event: &RawEvent,
    state: &UserState,
    stats: &UserStats,
    session_id: &str,
    now_ms: u64,
) -> FeatureVector {
    let values = vec![
        if event.is_correct { 1.0 } else { 0.0 },
        speed_score(event.response_time_ms),
        engagement(event),
        state.attention,
        state.fatigue,
        state.motivation,
        state.cognitive.mem,
        state.cognitive.speed,
        state.cognitive.stability,
        stats.recent_accuracy.unwrap_or(0.5),
    ];

    FeatureVector {
        session_id: session_id.to_string(),
        version: FEATURE_VERSION,
        values,
        labels: FEATURE_LABELS.iter().map(|s| s.to_string()).collect(),
        norm_method: NORM_METHOD.to_string(),
        ts: now_ms,
    }
}
