use anyhow::Result;
use async_trait::async_trait;

use crate::features::model::FeatureVector;

/// Persistence surface for versioned feature vectors.
#[async_trait]
pub trait FeatureRepository: Send + Sync {
    /// Writes the vector once. A later write for the same
    /// (session_id, version) is a no-op.
    async fn persist(&self, vector: &FeatureVector) -> Result<()>;

    async fn fetch(&self, session_id: &str, version: i64) -> Result<Option<FeatureVector>>;

    /// Highest-version vector for the session. Accepts both the legacy
    /// bare-array payload and the current object shape; a legacy row is
    /// rewritten in the current shape after decoding.
    async fn fetch_latest(&self, session_id: &str) -> Result<Option<FeatureVector>>;
}
