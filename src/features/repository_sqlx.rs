use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::{AnyPool, Row};

use crate::features::model::{FeaturePayload, FeatureVector};
use crate::features::repository::FeatureRepository;

pub struct SqlxFeatureRepository {
    pool: AnyPool,
}

impl SqlxFeatureRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    fn decode_row(r: &sqlx::any::AnyRow) -> anyhow::Result<(FeatureVector, bool)> {
        let session_id: String = r.get("session_id");
        let version: i64 = r.get("version");
        let created_ms: i64 = r.get("created_ms");
        let payload_json: String = r.get("payload");

        let payload: FeaturePayload =
            serde_json::from_str(&payload_json).context("malformed feature payload")?;
        let legacy = payload.is_legacy();

        let vector = payload
            .into_vector(&session_id, version, created_ms.max(0) as u64)
            .map_err(|e| anyhow!("{e}"))?;
        Ok((vector, legacy))
    }

    /// Rewrites a legacy row in the current shape. Best effort: a miss here
    /// only delays the migration to the next read.
    async fn write_back(&self, vector: &FeatureVector) {
        let payload = match serde_json::to_string(&FeaturePayload::from_vector(vector)) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "feature payload re-encode failed");
                return;
            }
        };

        let res = sqlx::query(
            r#"UPDATE feature_vectors SET payload = ? WHERE session_id = ? AND version = ?;"#,
        )
        .bind(payload)
        .bind(&vector.session_id)
        .bind(vector.version)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => tracing::debug!(
                session_id = %vector.session_id,
                version = vector.version,
                "migrated legacy feature payload"
            ),
            Err(e) => tracing::warn!(error = %e, "legacy feature migration failed"),
        }
    }
}

#[async_trait]
impl FeatureRepository for SqlxFeatureRepository {
    async fn persist(&self, vector: &FeatureVector) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&FeaturePayload::from_vector(vector))?;

        // Written once per decision: a replay keeps the original row.
        sqlx::query(
            r#"
INSERT INTO feature_vectors (session_id, version, payload, created_ms)
VALUES (?, ?, ?, ?)
ON CONFLICT (session_id, version) DO NOTHING;
"#,
        )
        .bind(&vector.session_id)
        .bind(vector.version)
        .bind(payload)
        .bind(vector.ts as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch(&self, session_id: &str, version: i64) -> anyhow::Result<Option<FeatureVector>> {
        let row = sqlx::query(
            r#"
SELECT session_id, version, payload, created_ms
FROM feature_vectors
WHERE session_id = ? AND version = ?;
"#,
        )
        .bind(session_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let (vector, legacy) = Self::decode_row(&r)?;
                if legacy {
                    self.write_back(&vector).await;
                }
                Ok(Some(vector))
            }
            None => Ok(None),
        }
    }

    async fn fetch_latest(&self, session_id: &str) -> anyhow::Result<Option<FeatureVector>> {
        let row = sqlx::query(
            r#"
SELECT session_id, version, payload, created_ms
FROM feature_vectors
WHERE session_id = ?
ORDER BY version DESC
LIMIT 1;
"#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let (vector, legacy) = Self::decode_row(&r)?;
                if legacy {
                    self.write_back(&vector).await;
                }
                Ok(Some(vector))
            }
            None => Ok(None),
        }
    }
}
