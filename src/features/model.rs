use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Current feature schema version. Bump when the label set changes.
pub const FEATURE_VERSION: i64 = 2;

/// Fixed label set for [`FEATURE_VERSION`]. Order is the vector layout.
pub const FEATURE_LABELS: [&str; 10] = [
    "accuracy",
    "speed_score",
    "engagement",
    "attention",
    "fatigue",
    "motivation",
    "mem",
    "speed",
    "stability",
    "recent_accuracy",
];

pub const NORM_METHOD: &str = "unit_clamp";

/// Deterministic fixed-length feature vector for one decision.
///
/// (session_id, version) is unique; the vector is written once per decision
/// and read back by the delayed-reward handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub session_id: String,
    pub version: i64,
    pub values: Vec<f64>,
    pub labels: Vec<String>,
    pub norm_method: String,
    pub ts: u64,
}

impl FeatureVector {
    pub fn expected_len(version: i64) -> Option<usize> {
        match version {
            // v1 carried the first six signals only
            1 => Some(6),
            2 => Some(FEATURE_LABELS.len()),
            _ => None,
        }
    }

    /// Label set for a schema version; the v1 layout is a prefix of v2.
    pub fn schema_labels(version: i64) -> Vec<String> {
        let n = Self::expected_len(version).unwrap_or(FEATURE_LABELS.len());
        FEATURE_LABELS.iter().take(n).map(|s| s.to_string()).collect()
    }

    pub fn check_shape(&self) -> Result<(), AppError> {
        match Self::expected_len(self.version) {
            Some(n) if self.values.len() == n => Ok(()),
            Some(n) => Err(AppError::invalid(format!(
                "feature vector v{} must have {} values, got {}",
                self.version,
                n,
                self.values.len()
            ))),
            None => Err(AppError::invalid(format!(
                "unknown feature schema version {}",
                self.version
            ))),
        }
    }
}

fn default_norm_method() -> String {
    NORM_METHOD.to_string()
}

/// Stored wire shape.
///
/// Early deployments persisted a bare value array; current rows carry the
/// labelled object. Readers must accept both, and after a legacy read the
/// row is migrated back to the current shape.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeaturePayload {
    Current {
        values: Vec<f64>,
        labels: Vec<String>,
        #[serde(default = "default_norm_method")]
        norm_method: String,
        ts: u64,
    },
    Legacy(Vec<f64>),
}

impl FeaturePayload {
    pub fn is_legacy(&self) -> bool {
        matches!(self, FeaturePayload::Legacy(_))
    }

    /// Expands the stored payload into a full vector. Legacy arrays take
    /// the schema labels for their version and the row's write time.
    pub fn into_vector(
        self,
        session_id: &str,
        version: i64,
        created_ms: u64,
    ) -> Result<FeatureVector, AppError> {
        let v = match self {
            FeaturePayload::Current {
                values,
                labels,
                norm_method,
                ts,
            } => FeatureVector {
                session_id: session_id.to_string(),
                version,
                values,
                labels,
                norm_method,
                ts,
            },
            FeaturePayload::Legacy(values) => FeatureVector {
                session_id: session_id.to_string(),
                version,
                values,
                labels: FeatureVector::schema_labels(version),
                norm_method: NORM_METHOD.to_string(),
                ts: created_ms,
            },
        };
        v.check_shape()?;
        Ok(v)
    }

    pub fn from_vector(v: &FeatureVector) -> Self {
        FeaturePayload::Current {
            values: v.values.clone(),
            labels: v.labels.clone(),
            norm_method: v.norm_method.clone(),
            ts: v.ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ten_values() -> Vec<f64> {
        (0..10).map(|i| i as f64 / 10.0).collect()
    }

    #[test]
    fn current_payload_round_trips() {
        let v = FeatureVector {
            session_id: "s1".into(),
            version: FEATURE_VERSION,
            values: ten_values(),
            labels: FEATURE_LABELS.iter().map(|s| s.to_string()).collect(),
            norm_method: NORM_METHOD.into(),
            ts: 7,
        };

        let json = serde_json::to_string(&FeaturePayload::from_vector(&v)).unwrap();
        let parsed: FeaturePayload = serde_json::from_str(&json).unwrap();
        let back = parsed.into_vector("s1", FEATURE_VERSION, 999).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn legacy_array_decodes_with_schema_labels() {
        let json = serde_json::to_string(&ten_values()).unwrap();
        let parsed: FeaturePayload = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_legacy());

        let v = parsed.into_vector("s1", FEATURE_VERSION, 123).unwrap();
        assert_eq!(v.values, ten_values());
        assert_eq!(v.labels.len(), FEATURE_LABELS.len());
        assert_eq!(v.ts, 123);
    }

    #[test]
    fn both_shapes_produce_the_same_values() {
        let legacy_json = serde_json::to_string(&ten_values()).unwrap();
        let current_json = serde_json::json!({
            "values": ten_values(),
            "labels": FEATURE_LABELS,
            "ts": 5,
        })
        .to_string();

        let a: FeaturePayload = serde_json::from_str(&legacy_json).unwrap();
        let b: FeaturePayload = serde_json::from_str(&current_json).unwrap();

        let va = a.into_vector("s", FEATURE_VERSION, 5).unwrap();
        let vb = b.into_vector("s", FEATURE_VERSION, 5).unwrap();
        assert_eq!(va.values, vb.values);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let parsed: FeaturePayload = serde_json::from_str("[0.1, 0.2]").unwrap();
        assert!(parsed.into_vector("s1", FEATURE_VERSION, 0).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let parsed: FeaturePayload =
            serde_json::from_str(&serde_json::to_string(&ten_values()).unwrap()).unwrap();
        assert!(parsed.into_vector("s1", 99, 0).is_err());
    }
}
