use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "PROCESSING" => Some(TaskStatus::Processing),
            "DONE" => Some(TaskStatus::Done),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// DONE and FAILED are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

/// One durable delayed-reward correction.
///
/// Invariants:
/// - at most one non-terminal row per idempotency key
/// - status transitions are monotone except PROCESSING→PENDING on failure
#[derive(Clone, Debug)]
pub struct DelayedRewardTask {
    pub id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub due_ms: u64,
    pub reward: f64,
    pub idempotency_key: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest claim time; pushed forward by the retry backoff.
    pub next_eligible_ms: u64,
    pub created_ms: u64,
}

/// Enqueue request.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub user_id: String,
    pub session_id: Option<String>,
    pub due_ms: u64,
    pub reward: f64,
    pub idempotency_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Done,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }
}
