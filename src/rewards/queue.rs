use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, instrument};

use crate::db::with_retries;
use crate::error::AppError;
use crate::rewards::model::{DelayedRewardTask, NewTask, TaskStatus};
use crate::rewards::repository::RewardQueueRepository;
use crate::state::model::WordState;
use crate::time::{Clock, new_id};

/// Enqueue-side API of the delayed-reward queue.
///
/// Guarantees:
/// - enqueue is idempotent on the idempotency key: a duplicate returns the
///   existing row, rewards never stack
/// - non-finite rewards are rejected before anything is persisted
/// - due time is never earlier than `now + min_delay`
pub struct RewardQueue {
    repo: Arc<dyn RewardQueueRepository>,
    clock: Arc<dyn Clock>,
    min_delay_ms: u64,
    default_delay_ms: u64,
    /// Wakes the worker loop immediately after an enqueue.
    wakeup: Arc<Notify>,
}

impl RewardQueue {
    pub fn new(
        repo: Arc<dyn RewardQueueRepository>,
        clock: Arc<dyn Clock>,
        min_delay_ms: u64,
        default_delay_ms: u64,
    ) -> Self {
        Self {
            repo,
            clock,
            min_delay_ms,
            default_delay_ms: default_delay_ms.max(min_delay_ms),
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn wakeup_handle(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    /// Due time for a reward correction.
    ///
    /// Priority: the word's next review date when it is at least one
    /// minute out; else the current interval; else the configured default.
    pub fn compute_due(&self, word: Option<&WordState>, event_ts_ms: u64) -> u64 {
        let floor = event_ts_ms + self.min_delay_ms;

        if let Some(w) = word {
            if let Some(next_review) = w.next_review_ms {
                if next_review >= floor {
                    return next_review;
                }
            }
            if w.interval_days > 0.0 {
                let by_interval = event_ts_ms + (w.interval_days * 86_400_000.0) as u64;
                if by_interval >= floor {
                    return by_interval;
                }
            }
        }

        (event_ts_ms + self.default_delay_ms).max(floor)
    }

    #[instrument(
        skip(self, new),
        target = "reward_queue",
        fields(user_id = %new.user_id, key = %new.idempotency_key)
    )]
    pub async fn enqueue(&self, new: NewTask) -> Result<DelayedRewardTask, AppError> {
        if !new.reward.is_finite() {
            return Err(AppError::invalid("reward must be finite"));
        }
        if new.idempotency_key.is_empty() {
            return Err(AppError::invalid("idempotency_key must not be empty"));
        }

        let now = self.clock.now_ms();
        let due_ms = new.due_ms.max(now + self.min_delay_ms);

        let task = DelayedRewardTask {
            id: new_id(),
            user_id: new.user_id,
            session_id: new.session_id,
            due_ms,
            reward: new.reward,
            idempotency_key: new.idempotency_key,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            next_eligible_ms: 0,
            created_ms: now,
        };

        // Safe to retry: the insert is a no-op once the key exists.
        let row = with_retries("reward_enqueue", 3, || self.repo.insert_or_fetch(&task))
            .await
            .map_err(AppError::from_store)?;

        if row.id != task.id {
            debug!(existing_id = %row.id, "idempotency hit; returning existing task");
        } else {
            self.wakeup.notify_one();
        }

        Ok(row)
    }
}
