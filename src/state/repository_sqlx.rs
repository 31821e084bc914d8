use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{AnyPool, Row};

use crate::state::model::{
    AnswerRecord, CognitiveProfile, StateSnapshot, Trend, UserState, WordState,
};
use crate::state::repository::StateRepository;

/// SQLx-backed implementation of StateRepository.
/// Responsible only for persistence and row mapping.
pub struct SqlxStateRepository {
    pool: AnyPool,
}

impl SqlxStateRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateRepository for SqlxStateRepository {
    async fn fetch_state(&self, user_id: &str) -> anyhow::Result<Option<UserState>> {
        let row = sqlx::query(
            r#"
SELECT user_id, attention, fatigue, motivation, mem, speed, stability,
       trend, interaction_count, updated_ms
FROM amas_user_states
WHERE user_id = ?;
"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_state(&r)?)),
            None => Ok(None),
        }
    }

    async fn fetch_daily(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> anyhow::Result<Option<StateSnapshot>> {
        let row = sqlx::query(
            r#"
SELECT user_id, date, attention, fatigue, motivation, mem, speed, stability, trend
FROM user_state_history
WHERE user_id = ? AND date = ?;
"#,
        )
        .bind(user_id)
        .bind(date.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_snapshot(&r)?)),
            None => Ok(None),
        }
    }

    async fn recent_answers(&self, user_id: &str, limit: u32) -> anyhow::Result<Vec<AnswerRecord>> {
        let rows = sqlx::query(
            r#"
SELECT id, user_id, word_id, is_correct, response_time_ms, timestamp_ms
FROM answer_records
WHERE user_id = ?
ORDER BY timestamp_ms DESC
LIMIT ?;
"#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_answer(&r) {
                Ok(a) => out.push(a),
                Err(e) => {
                    // poison-row resilience: skip but don't fail the read
                    tracing::warn!(error = %e, "skipping malformed answer row");
                }
            }
        }
        Ok(out)
    }

    async fn fetch_word_state(
        &self,
        user_id: &str,
        word_id: &str,
    ) -> anyhow::Result<Option<WordState>> {
        let row = sqlx::query(
            r#"
SELECT user_id, word_id, interval_days, next_review_ms, reps, lapses, mastery
FROM word_states
WHERE user_id = ? AND word_id = ?;
"#,
        )
        .bind(user_id)
        .bind(word_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_word(&r)?)),
            None => Ok(None),
        }
    }

    async fn persist_event(
        &self,
        state: &UserState,
        rollup: &StateSnapshot,
        answer: &AnswerRecord,
        word: &WordState,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
INSERT INTO amas_user_states
  (user_id, attention, fatigue, motivation, mem, speed, stability, trend, interaction_count, updated_ms)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (user_id) DO UPDATE SET
  attention = excluded.attention,
  fatigue = excluded.fatigue,
  motivation = excluded.motivation,
  mem = excluded.mem,
  speed = excluded.speed,
  stability = excluded.stability,
  trend = excluded.trend,
  interaction_count = excluded.interaction_count,
  updated_ms = excluded.updated_ms;
"#,
        )
        .bind(&state.user_id)
        .bind(state.attention)
        .bind(state.fatigue)
        .bind(state.motivation)
        .bind(state.cognitive.mem)
        .bind(state.cognitive.speed)
        .bind(state.cognitive.stability)
        .bind(state.trend.as_str())
        .bind(u64_to_i64(state.interaction_count)?)
        .bind(u64_to_i64(state.updated_ms)?)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
INSERT INTO user_state_history
  (user_id, date, attention, fatigue, motivation, mem, speed, stability, trend)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (user_id, date) DO UPDATE SET
  attention = excluded.attention,
  fatigue = excluded.fatigue,
  motivation = excluded.motivation,
  mem = excluded.mem,
  speed = excluded.speed,
  stability = excluded.stability,
  trend = excluded.trend;
"#,
        )
        .bind(&rollup.user_id)
        .bind(rollup.date.to_string())
        .bind(rollup.attention)
        .bind(rollup.fatigue)
        .bind(rollup.motivation)
        .bind(rollup.mem)
        .bind(rollup.speed)
        .bind(rollup.stability)
        .bind(rollup.trend.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
INSERT INTO answer_records
  (id, user_id, word_id, is_correct, response_time_ms, timestamp_ms)
VALUES (?, ?, ?, ?, ?, ?);
"#,
        )
        .bind(&answer.id)
        .bind(&answer.user_id)
        .bind(&answer.word_id)
        .bind(if answer.is_correct { 1i64 } else { 0i64 })
        .bind(u64_to_i64(answer.response_time_ms)?)
        .bind(u64_to_i64(answer.timestamp_ms)?)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
INSERT INTO word_states
  (user_id, word_id, interval_days, next_review_ms, reps, lapses, mastery)
VALUES (?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (user_id, word_id) DO UPDATE SET
  interval_days = excluded.interval_days,
  next_review_ms = excluded.next_review_ms,
  reps = excluded.reps,
  lapses = excluded.lapses,
  mastery = excluded.mastery;
"#,
        )
        .bind(&word.user_id)
        .bind(&word.word_id)
        .bind(word.interval_days)
        .bind(word.next_review_ms.map(|v| v as i64))
        .bind(word.reps as i64)
        .bind(word.lapses as i64)
        .bind(word.mastery)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        for table in [
            "amas_user_states",
            "user_state_history",
            "answer_records",
            "word_states",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE user_id = ?;"))
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/* =========================
Row mapping + conversions
========================= */

fn row_to_state(r: &sqlx::any::AnyRow) -> anyhow::Result<UserState> {
    Ok(UserState {
        user_id: r.get::<String, _>("user_id"),
        attention: r.get::<f64, _>("attention"),
        fatigue: r.get::<f64, _>("fatigue"),
        motivation: r.get::<f64, _>("motivation"),
        cognitive: CognitiveProfile {
            mem: r.get::<f64, _>("mem"),
            speed: r.get::<f64, _>("speed"),
            stability: r.get::<f64, _>("stability"),
        },
        trend: Trend::parse(&r.get::<String, _>("trend")),
        interaction_count: i64_to_u64(r.get("interaction_count"))?,
        updated_ms: i64_to_u64(r.get("updated_ms"))?,
    })
}

fn row_to_snapshot(r: &sqlx::any::AnyRow) -> anyhow::Result<StateSnapshot> {
    let date_str: String = r.get("date");
    let date = date_str
        .parse::<NaiveDate>()
        .context("invalid history date")?;

    Ok(StateSnapshot {
        user_id: r.get::<String, _>("user_id"),
        date,
        attention: r.get::<f64, _>("attention"),
        fatigue: r.get::<f64, _>("fatigue"),
        motivation: r.get::<f64, _>("motivation"),
        mem: r.get::<f64, _>("mem"),
        speed: r.get::<f64, _>("speed"),
        stability: r.get::<f64, _>("stability"),
        trend: Trend::parse(&r.get::<String, _>("trend")),
    })
}

fn row_to_answer(r: &sqlx::any::AnyRow) -> anyhow::Result<AnswerRecord> {
    Ok(AnswerRecord {
        id: r.get::<String, _>("id"),
        user_id: r.get::<String, _>("user_id"),
        word_id: r.get::<String, _>("word_id"),
        is_correct: r.get::<i64, _>("is_correct") != 0,
        response_time_ms: i64_to_u64(r.get("response_time_ms"))?,
        timestamp_ms: i64_to_u64(r.get("timestamp_ms"))?,
    })
}

fn row_to_word(r: &sqlx::any::AnyRow) -> anyhow::Result<WordState> {
    Ok(WordState {
        user_id: r.get::<String, _>("user_id"),
        word_id: r.get::<String, _>("word_id"),
        interval_days: r.get::<f64, _>("interval_days"),
        next_review_ms: r
            .get::<Option<i64>, _>("next_review_ms")
            .map(i64_to_u64)
            .transpose()?,
        reps: i64_to_u32(r.get("reps"))?,
        lapses: i64_to_u32(r.get("lapses"))?,
        mastery: r.get::<f64, _>("mastery"),
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
