use anyhow::Result;
use async_trait::async_trait;

use crate::rewards::model::DelayedRewardTask;

/// Persistence surface for the delayed-reward queue.
///
/// `claim_due` is the row-level ownership point: a task claimed by one
/// worker pass cannot be claimed again until it is released or re-parked.
#[async_trait]
pub trait RewardQueueRepository: Send + Sync {
    /// Inserts the task, or returns the existing row unchanged when the
    /// idempotency key is already present.
    async fn insert_or_fetch(&self, task: &DelayedRewardTask) -> Result<DelayedRewardTask>;

    /// Atomically claims up to `limit` PENDING tasks with
    /// `due_ms ≤ now ∧ next_eligible_ms ≤ now`, ordered by due time then
    /// creation time, moving each to PROCESSING with attempts+1.
    async fn claim_due(&self, now_ms: u64, limit: usize) -> Result<Vec<DelayedRewardTask>>;

    async fn mark_done(&self, id: &str) -> Result<()>;

    /// Returns a PROCESSING task to PENDING with an error note and a
    /// backoff-deferred eligibility time.
    async fn release_for_retry(&self, id: &str, error: &str, next_eligible_ms: u64) -> Result<()>;

    async fn mark_failed(&self, id: &str, error: &str) -> Result<()>;

    async fn fetch_by_key(&self, idempotency_key: &str) -> Result<Option<DelayedRewardTask>>;
}
