use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Ok,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Ok => "OK",
            StageStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "FAILED" {
            StageStatus::Failed
        } else {
            StageStatus::Ok
        }
    }
}

/// One named pipeline stage inside a decision.
#[derive(Clone, Debug, PartialEq)]
pub struct StageRecord {
    pub stage: String,
    pub status: StageStatus,
    pub started_ms: u64,
    pub ended_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl StageRecord {
    pub fn ok(stage: &str, started_ms: u64, ended_ms: u64) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Ok,
            started_ms,
            ended_ms: Some(ended_ms),
            duration_ms: Some(ended_ms.saturating_sub(started_ms)),
            error: None,
        }
    }

    pub fn failed(stage: &str, started_ms: u64, ended_ms: u64, error: String) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Failed,
            started_ms,
            ended_ms: Some(ended_ms),
            duration_ms: Some(ended_ms.saturating_sub(started_ms)),
            error: Some(error),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestionStatus {
    Success,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Success => "SUCCESS",
            IngestionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "FAILED" {
            IngestionStatus::Failed
        } else {
            IngestionStatus::Success
        }
    }
}

/// Full audit record of one decision.
///
/// Upserted by `decision_id`; the stage list is replaced atomically with
/// the trace row.
#[derive(Clone, Debug, PartialEq)]
pub struct DecisionTrace {
    pub decision_id: String,
    pub answer_record_id: Option<String>,
    pub session_id: Option<String>,
    pub timestamp_ms: u64,
    pub decision_source: String,
    pub weights_snapshot: Option<serde_json::Value>,
    pub selected_action: serde_json::Value,
    pub confidence: f64,
    pub reward: Option<f64>,
    pub stages: Vec<StageRecord>,
    pub ingestion_status: IngestionStatus,
}
