use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Every non-success visible to a caller maps to exactly one of these kinds
/// and carries a stable machine-readable code via [`AppError::code`].
#[derive(Error, Debug)]
pub enum AppError {
    /// Caller contract violated. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Transient store/network failure that survived bounded retries.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Idempotency or concurrent-update collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Local deadline exceeded.
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// Store unavailable beyond retries. Fatal for the request, not the process.
    #[error("dependency unavailable: {0}")]
    Dependency(String),

    /// Invariant violation. Logged with full context, opaque to callers.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::Transient(_) => "TRANSIENT",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Dependency(_) => "DEPENDENCY",
            AppError::Internal(_) => "INTERNAL",
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        AppError::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        AppError::Internal(msg.to_string())
    }

    /// Maps a repository-layer error to the user-facing taxonomy.
    ///
    /// Transient classification happens below this boundary; anything that
    /// reaches here already exhausted its retries.
    pub fn from_store(e: anyhow::Error) -> Self {
        AppError::Dependency(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AppError::invalid("x").code(), "INVALID_INPUT");
        assert_eq!(AppError::Timeout("t".into()).code(), "TIMEOUT");
        assert_eq!(
            AppError::from_store(anyhow::anyhow!("pool closed")).code(),
            "DEPENDENCY"
        );
    }
}
