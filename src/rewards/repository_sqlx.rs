use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::{AnyPool, Row};

use crate::rewards::model::{DelayedRewardTask, TaskStatus};
use crate::rewards::repository::RewardQueueRepository;

/// SQLx-backed implementation of RewardQueueRepository.
///
/// Claiming uses per-row conditional updates on `status`, so a row is
/// owned by exactly one worker pass at a time even with a concurrent
/// claimer racing on the same candidate set.
pub struct SqlxRewardQueueRepository {
    pool: AnyPool,
}

impl SqlxRewardQueueRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RewardQueueRepository for SqlxRewardQueueRepository {
    async fn insert_or_fetch(&self, task: &DelayedRewardTask) -> anyhow::Result<DelayedRewardTask> {
        // A duplicate key keeps the original row: rewards never stack.
        sqlx::query(
            r#"
INSERT INTO delayed_reward_tasks
  (id, user_id, session_id, due_ms, reward, idempotency_key, status, attempts,
   last_error, next_eligible_ms, created_ms)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (idempotency_key) DO NOTHING;
"#,
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(task.session_id.as_deref())
        .bind(u64_to_i64(task.due_ms)?)
        .bind(task.reward)
        .bind(&task.idempotency_key)
        .bind(task.status.as_str())
        .bind(task.attempts as i64)
        .bind(task.last_error.as_deref())
        .bind(u64_to_i64(task.next_eligible_ms)?)
        .bind(u64_to_i64(task.created_ms)?)
        .execute(&self.pool)
        .await?;

        self.fetch_by_key(&task.idempotency_key)
            .await?
            .ok_or_else(|| anyhow!("task row vanished after insert"))
    }

    async fn claim_due(&self, now_ms: u64, limit: usize) -> anyhow::Result<Vec<DelayedRewardTask>> {
        let now = u64_to_i64(now_ms)?;

        let candidates = sqlx::query(
            r#"
SELECT id FROM delayed_reward_tasks
WHERE status = 'PENDING' AND due_ms <= ? AND next_eligible_ms <= ?
ORDER BY due_ms ASC, created_ms ASC
LIMIT ?;
"#,
        )
        .bind(now)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::new();
        for row in candidates {
            let id: String = row.get("id");

            // CAS on status: a miss means another claimer won the row.
            let res = sqlx::query(
                r#"
UPDATE delayed_reward_tasks
SET status = 'PROCESSING', attempts = attempts + 1
WHERE id = ? AND status = 'PENDING';
"#,
            )
            .bind(&id)
            .execute(&self.pool)
            .await?;

            if res.rows_affected() != 1 {
                tracing::debug!(task_id = %id, "claim CAS miss; skipping task");
                continue;
            }

            if let Some(task) = self.fetch_by_id(&id).await? {
                claimed.push(task);
            }
        }

        Ok(claimed)
    }

    async fn mark_done(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
UPDATE delayed_reward_tasks
SET status = 'DONE', last_error = NULL
WHERE id = ? AND status = 'PROCESSING';
"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_for_retry(
        &self,
        id: &str,
        error: &str,
        next_eligible_ms: u64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
UPDATE delayed_reward_tasks
SET status = 'PENDING', last_error = ?, next_eligible_ms = ?
WHERE id = ? AND status = 'PROCESSING';
"#,
        )
        .bind(error)
        .bind(u64_to_i64(next_eligible_ms)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
UPDATE delayed_reward_tasks
SET status = 'FAILED', last_error = ?
WHERE id = ? AND status = 'PROCESSING';
"#,
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_by_key(
        &self,
        idempotency_key: &str,
    ) -> anyhow::Result<Option<DelayedRewardTask>> {
        let row = sqlx::query(
            r#"
SELECT id, user_id, session_id, due_ms, reward, idempotency_key, status,
       attempts, last_error, next_eligible_ms, created_ms
FROM delayed_reward_tasks
WHERE idempotency_key = ?;
"#,
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_task(&r)?)),
            None => Ok(None),
        }
    }
}

impl SqlxRewardQueueRepository {
    async fn fetch_by_id(&self, id: &str) -> anyhow::Result<Option<DelayedRewardTask>> {
        let row = sqlx::query(
            r#"
SELECT id, user_id, session_id, due_ms, reward, idempotency_key, status,
       attempts, last_error, next_eligible_ms, created_ms
FROM delayed_reward_tasks
WHERE id = ?;
"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_task(&r)?)),
            None => Ok(None),
        }
    }
}

/* =========================
Row mapping + conversions
========================= */

fn row_to_task(r: &sqlx::any::AnyRow) -> anyhow::Result<DelayedRewardTask> {
    let status_str: String = r.get("status");
    let status = TaskStatus::parse(&status_str)
        .with_context(|| format!("unknown task status: {status_str}"))?;

    Ok(DelayedRewardTask {
        id: r.get::<String, _>("id"),
        user_id: r.get::<String, _>("user_id"),
        session_id: r.get::<Option<String>, _>("session_id"),
        due_ms: i64_to_u64(r.get("due_ms"))?,
        reward: r.get::<f64, _>("reward"),
        idempotency_key: r.get::<String, _>("idempotency_key"),
        status,
        attempts: i64_to_u32(r.get("attempts"))?,
        last_error: r.get::<Option<String>, _>("last_error"),
        next_eligible_ms: i64_to_u64(r.get("next_eligible_ms"))?,
        created_ms: i64_to_u64(r.get("created_ms"))?,
    })
}

fn i64_to_u64(v: i64) -> anyhow::Result<u64> {
    if v < 0 {
        return Err(anyhow!("negative i64 where u64 expected: {v}"));
    }
    Ok(v as u64)
}

fn i64_to_u32(v: i64) -> anyhow::Result<u32> {
    if v < 0 || v > u32::MAX as i64 {
        return Err(anyhow!("out of range for u32: {v}"));
    }
    Ok(v as u32)
}

fn u64_to_i64(v: u64) -> anyhow::Result<i64> {
    if v > i64::MAX as u64 {
        return Err(anyhow!("u64 too large for i64: {v}"));
    }
    Ok(v as i64)
}
