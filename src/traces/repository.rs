use anyhow::Result;
use async_trait::async_trait;

use crate::traces::model::DecisionTrace;

/// Persistence surface for decision traces.
#[async_trait]
pub trait TraceRepository: Send + Sync {
    /// One transaction: upsert the trace by decision id and replace its
    /// stages (delete-then-create).
    async fn persist(&self, trace: &DecisionTrace) -> Result<()>;

    /// Upserts a FAILED ingestion marker so the decision id survives even
    /// when the full trace could not be recorded.
    async fn persist_failure_marker(&self, decision_id: &str, timestamp_ms: u64) -> Result<()>;

    async fn fetch(&self, decision_id: &str) -> Result<Option<DecisionTrace>>;
}
