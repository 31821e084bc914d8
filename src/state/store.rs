use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::db::with_retries;
use crate::error::AppError;
use crate::logger::warn_if_slow;
use crate::state::model::{AnswerRecord, UserState, UserStats, WordState};
use crate::state::repository::StateRepository;
use crate::state::update;
use crate::time::{Clock, utc_day};

/// How many answers back the recent-accuracy window reaches.
const RECENT_WINDOW: u32 = 20;

/// Pipeline-facing cognitive state store.
///
/// Owns the daily-rollup merge and maps repository errors into the crate
/// taxonomy; all raw SQL lives below the [`StateRepository`] boundary.
pub struct StateStore {
    repo: Arc<dyn StateRepository>,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    pub fn new(repo: Arc<dyn StateRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    #[instrument(skip(self), target = "state_store", fields(user_id = %user_id))]
    pub async fn load_or_init(&self, user_id: &str) -> Result<UserState, AppError> {
        let found = warn_if_slow("db_fetch_state", Duration::from_millis(100), async {
            self.repo.fetch_state(user_id).await
        })
        .await
        .map_err(AppError::from_store)?;

        Ok(match found {
            Some(s) => s,
            None => {
                debug!("no live state; initializing defaults");
                UserState::initial(user_id, self.clock.now_ms())
            }
        })
    }

    /// Interaction count plus accuracy over the last [`RECENT_WINDOW`]
    /// answers (indexed range query, newest first).
    pub async fn derive_stats(&self, state: &UserState) -> Result<UserStats, AppError> {
        let answers = self
            .repo
            .recent_answers(&state.user_id, RECENT_WINDOW)
            .await
            .map_err(AppError::from_store)?;

        let recent_accuracy = if answers.is_empty() {
            None
        } else {
            let correct = answers.iter().filter(|a| a.is_correct).count();
            Some(correct as f64 / answers.len() as f64)
        };

        Ok(UserStats {
            interaction_count: state.interaction_count,
            recent_accuracy,
        })
    }

    /// Commits one decision's writes: live state, daily EMA rollup, answer
    /// record and scored-word state, in a single transaction.
    #[instrument(skip_all, target = "state_store", fields(user_id = %state.user_id))]
    pub async fn persist(
        &self,
        state: &UserState,
        answer: &AnswerRecord,
        word: &WordState,
    ) -> Result<(), AppError> {
        let date = utc_day(state.updated_ms);

        let prev_rollup = self
            .repo
            .fetch_daily(&state.user_id, date)
            .await
            .map_err(AppError::from_store)?;

        let rollup = update::merge_daily(prev_rollup.as_ref(), state, date);

        warn_if_slow("db_persist_event", Duration::from_millis(100), async {
            // The transaction is atomic, so a transient failure can be
            // retried without double-applying any row.
            with_retries("persist_event", 3, || {
                self.repo.persist_event(state, &rollup, answer, word)
            })
            .await
        })
        .await
        .map_err(AppError::from_store)
    }

    pub async fn word_state(
        &self,
        user_id: &str,
        word_id: &str,
    ) -> Result<Option<WordState>, AppError> {
        self.repo
            .fetch_word_state(user_id, word_id)
            .await
            .map_err(AppError::from_store)
    }

    #[instrument(skip(self), target = "state_store", fields(user_id = %user_id))]
    pub async fn reset(&self, user_id: &str) -> Result<(), AppError> {
        self.repo
            .delete_user(user_id)
            .await
            .map_err(AppError::from_store)
    }
}
