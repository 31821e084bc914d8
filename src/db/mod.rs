pub mod schema;

use std::future::Future;
use std::time::Duration;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;

#[derive(Clone)]
pub struct Db {
    pub pool: AnyPool,
}

impl Db {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        schema::migrate(&self.pool).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Classifies store errors that are worth retrying.
///
/// Everything else (constraint violations, decode errors, closed pool)
/// surfaces immediately.
pub fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_lowercase();
            msg.contains("deadlock")
                || msg.contains("database is locked")
                || msg.contains("busy")
                || msg.contains("serialization")
                || msg.contains("could not serialize")
        }
        _ => false,
    }
}

/// Transient classification for repository-layer errors.
pub fn is_transient_err(e: &anyhow::Error) -> bool {
    e.downcast_ref::<sqlx::Error>()
        .map(is_transient)
        .unwrap_or(false)
}

/// Runs a store operation with bounded exponential backoff on transient
/// errors. Base 50ms, doubling per attempt. Anything non-transient
/// surfaces on the first hit.
pub async fn with_retries<T, F, Fut>(
    label: &'static str,
    max_attempts: u32,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient_err(&e) && attempt + 1 < max_attempts => {
                attempt += 1;
                let backoff = Duration::from_millis(50u64 << attempt.min(6));
                tracing::warn!(
                    target: "db",
                    label,
                    attempt,
                    error = %e,
                    "transient store error; retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
