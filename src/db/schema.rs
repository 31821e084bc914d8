use sqlx::AnyPool;

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // Live per-user cognitive state (one row per user).
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS amas_user_states (
  user_id TEXT PRIMARY KEY,
  attention DOUBLE PRECISION NOT NULL,
  fatigue DOUBLE PRECISION NOT NULL,
  motivation DOUBLE PRECISION NOT NULL,
  mem DOUBLE PRECISION NOT NULL,
  speed DOUBLE PRECISION NOT NULL,
  stability DOUBLE PRECISION NOT NULL,
  trend TEXT NOT NULL,
  interaction_count BIGINT NOT NULL,
  updated_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Daily EMA rollup, one row per (user, UTC day).
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS user_state_history (
  user_id TEXT NOT NULL,
  date TEXT NOT NULL,
  attention DOUBLE PRECISION NOT NULL,
  fatigue DOUBLE PRECISION NOT NULL,
  motivation DOUBLE PRECISION NOT NULL,
  mem DOUBLE PRECISION NOT NULL,
  speed DOUBLE PRECISION NOT NULL,
  stability DOUBLE PRECISION NOT NULL,
  trend TEXT NOT NULL,
  PRIMARY KEY (user_id, date)
);
"#,
    )
    .execute(pool)
    .await?;

    // Raw answer history; source of interaction counts and recent accuracy.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS answer_records (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  word_id TEXT NOT NULL,
  is_correct INTEGER NOT NULL,
  response_time_ms BIGINT NOT NULL,
  timestamp_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Per-word learning state; read by the delayed-reward due computation.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS word_states (
  user_id TEXT NOT NULL,
  word_id TEXT NOT NULL,
  interval_days DOUBLE PRECISION NOT NULL,
  next_review_ms BIGINT,
  reps INTEGER NOT NULL,
  lapses INTEGER NOT NULL,
  mastery DOUBLE PRECISION NOT NULL,
  PRIMARY KEY (user_id, word_id)
);
"#,
    )
    .execute(pool)
    .await?;

    // Versioned feature vectors, written once per decision.
    // Payload is JSON: either the current object shape or a legacy bare array.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS feature_vectors (
  session_id TEXT NOT NULL,
  version BIGINT NOT NULL,
  payload TEXT NOT NULL,
  created_ms BIGINT NOT NULL,
  PRIMARY KEY (session_id, version)
);
"#,
    )
    .execute(pool)
    .await?;

    // Durable delayed-reward queue.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS delayed_reward_tasks (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  session_id TEXT,
  due_ms BIGINT NOT NULL,
  reward DOUBLE PRECISION NOT NULL,
  idempotency_key TEXT NOT NULL UNIQUE,
  status TEXT NOT NULL,
  attempts INTEGER NOT NULL,
  last_error TEXT,
  next_eligible_ms BIGINT NOT NULL,
  created_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Decision traces + stages (stages replaced atomically with the trace).
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS decision_traces (
  decision_id TEXT PRIMARY KEY,
  answer_record_id TEXT,
  session_id TEXT,
  timestamp_ms BIGINT NOT NULL,
  decision_source TEXT NOT NULL,
  weights_snapshot TEXT,
  selected_action TEXT NOT NULL,
  confidence DOUBLE PRECISION NOT NULL,
  reward DOUBLE PRECISION,
  ingestion_status TEXT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS decision_trace_stages (
  id TEXT PRIMARY KEY,
  decision_id TEXT NOT NULL,
  stage TEXT NOT NULL,
  status TEXT NOT NULL,
  started_ms BIGINT NOT NULL,
  ended_ms BIGINT,
  duration_ms BIGINT,
  error TEXT
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_answers_user_ts ON answer_records(user_id, timestamp_ms DESC);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_reward_status_due ON delayed_reward_tasks(status, due_ms);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_trace_stages_decision ON decision_trace_stages(decision_id);"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
