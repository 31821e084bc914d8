use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::{AnyPool, Row};

use crate::time::new_id;
use crate::traces::model::{DecisionTrace, IngestionStatus, StageRecord, StageStatus};
use crate::traces::repository::TraceRepository;

pub struct SqlxTraceRepository {
    pool: AnyPool,
}

impl SqlxTraceRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TraceRepository for SqlxTraceRepository {
    async fn persist(&self, trace: &DecisionTrace) -> anyhow::Result<()> {
        let weights = trace
            .weights_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let action = serde_json::to_string(&trace.selected_action)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
INSERT INTO decision_traces
  (decision_id, answer_record_id, session_id, timestamp_ms, decision_source,
   weights_snapshot, selected_action, confidence, reward, ingestion_status)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (decision_id) DO UPDATE SET
  answer_record_id = excluded.answer_record_id,
  session_id = excluded.session_id,
  timestamp_ms = excluded.timestamp_ms,
  decision_source = excluded.decision_source,
  weights_snapshot = excluded.weights_snapshot,
  selected_action = excluded.selected_action,
  confidence = excluded.confidence,
  reward = excluded.reward,
  ingestion_status = excluded.ingestion_status;
"#,
        )
        .bind(&trace.decision_id)
        .bind(trace.answer_record_id.as_deref())
        .bind(trace.session_id.as_deref())
        .bind(u64_to_i64(trace.timestamp_ms)?)
        .bind(&trace.decision_source)
        .bind(weights)
        .bind(action)
        .bind(trace.confidence)
        .bind(trace.reward)
        .bind(trace.ingestion_status.as_str())
        .execute(&mut *tx)
        .await?;

        // Stages are replaced wholesale with the trace row.
        sqlx::query(r#"DELETE FROM decision_trace_stages WHERE decision_id = ?;"#)
            .bind(&trace.decision_id)
            .execute(&mut *tx)
            .await?;

        for stage in &trace.stages {
            sqlx::query(
                r#"
INSERT INTO decision_trace_stages
  (id, decision_id, stage, status, started_ms, ended_ms, duration_ms, error)
VALUES (?, ?, ?, ?, ?, ?, ?, ?);
"#,
            )
            .bind(new_id())
            .bind(&trace.decision_id)
            .bind(&stage.stage)
            .bind(stage.status.as_str())
            .bind(u64_to_i64(stage.started_ms)?)
            .bind(stage.ended_ms.map(|v| v as i64))
            .bind(stage.duration_ms.map(|v| v as i64))
            .bind(stage.error.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn persist_failure_marker(
        &self,
        decision_id: &str,
        timestamp_ms: u64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT INTO decision_traces
  (decision_id, answer_record_id, session_id, timestamp_ms, decision_source,
   weights_snapshot, selected_action, confidence, reward, ingestion_status)
VALUES (?, NULL, NULL, ?, 'unknown', NULL, ?, 0, NULL, 'FAILED')
ON CONFLICT (decision_id) DO UPDATE SET
  ingestion_status = 'FAILED',
  selected_action = excluded.selected_action;
"#,
        )
        .bind(decision_id)
        .bind(u64_to_i64(timestamp_ms)?)
        .bind(r#"{"error":"failed_to_record"}"#)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch(&self, decision_id: &str) -> anyhow::Result<Option<DecisionTrace>> {
        let row = sqlx::query(
            r#"
SELECT decision_id, answer_record_id, session_id, timestamp_ms, decision_source,
       weights_snapshot, selected_action, confidence, reward, ingestion_status
FROM decision_traces
WHERE decision_id = ?;
"#,
        )
        .bind(decision_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };

        let stage_rows = sqlx::query(
            r#"
SELECT stage, status, started_ms, ended_ms, duration_ms, error
FROM decision_trace_stages
WHERE decision_id = ?
ORDER BY started_ms ASC;
"#,
        )
        .bind(decision_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stages = Vec::with_capacity(stage_rows.len());
        for s in stage_rows {
            stages.push(StageRecord {
                stage: s.get::<String, _>("stage"),
                status: StageStatus::parse(&s.get::<String, _>("status")),
                started_ms: i64_to_u64(s.get("started_ms"))?,
                ended_ms: s.get::<Option<i64>, _>("ended_ms").map(|v| v as u64),
                duration_ms: s.get::<Option<i64>, _>("duration_ms").map(|v| v as u64),
                error: s.get::<Option<String>, _>("error"),
            });
        }

        let weights: Option<serde_json::Value> = r
            .get::<Option<String>, _>("weights_snapshot")
            .map(|w| serde_json::from_str(&w))
            .transpose()?;
        let action: serde_json::Value = serde_json::from_str(&r.get::<String, _>("selected_action"))?;

        Ok(Some(DecisionTrace {
            decision_id: r.get::<String, _>("decision_id"),
            answer_record_id: r.get::<Option<String>, _>("answer_record_id"),
            session_id: r.get::<Option<String>, _>("session_id"),
            timestamp_ms: i64_to_u64(r.get("timestamp_ms"))?,
            decision_source: r.get::<String, _>("decision_source"),
            weights_snapshot: weights,
            selected_action: action,
            confidence: r.get::<f64, _>("confidence"),
            reward: r.get::<Option<f64>, _>("reward"),
            stages,
            ingestion_status: IngestionStatus::parse(&r.get::<String, _>("ingestion_status")),
        }))
    }
}

fn u64_to_i64(v: u64) -> anyhow::Result<i64> {
    if v > i64::MAX as u64 {
        return Err(anyhow!("u64 too large for i64: {v}"));
    }
    Ok(v as i64)
}

fn i64_to_u64(v: i64) -> anyhow::Result<u64> {
    if v < 0 {
        return Err(anyhow!("negative i64 where u64 expected: {v}"));
    }
    Ok(v as u64)
}
