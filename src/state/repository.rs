use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::state::model::{AnswerRecord, StateSnapshot, UserState, WordState};

/// Persistence surface for the cognitive state store.
///
/// `persist_event` is the single write path of the decision pipeline and
/// must apply the state snapshot, the daily rollup, the answer record and
/// the scored-word update in one transaction.
#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn fetch_state(&self, user_id: &str) -> Result<Option<UserState>>;

    async fn fetch_daily(&self, user_id: &str, date: NaiveDate) -> Result<Option<StateSnapshot>>;

    /// Most recent answers first.
    async fn recent_answers(&self, user_id: &str, limit: u32) -> Result<Vec<AnswerRecord>>;

    async fn fetch_word_state(&self, user_id: &str, word_id: &str) -> Result<Option<WordState>>;

    /// Atomic commit of one decision's writes.
    async fn persist_event(
        &self,
        state: &UserState,
        rollup: &StateSnapshot,
        answer: &AnswerRecord,
        word: &WordState,
    ) -> Result<()>;

    /// Destroys the user's live state, rollups, answers and word states.
    async fn delete_user(&self, user_id: &str) -> Result<()>;
}
