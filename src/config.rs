fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string.
    pub database_url: String,

    /// Enables the background workers (delayed-reward worker, metrics
    /// collection, alert evaluation) on this instance.
    ///
    /// Exactly one instance should run with the leader flag set; non-leader
    /// instances still serve the decision pipeline.
    pub leader: bool,

    // =========================
    // Decision pipeline
    // =========================
    /// How long a selected strategy stays valid in the per-user cache.
    pub strategy_cache_ttl_ms: u64,

    /// Cold-start boundaries: interactions below `classify_until` run the
    /// classify phase, below `explore_until` the explore phase, then normal.
    pub classify_until: u64,
    pub explore_until: u64,

    // =========================
    // Delayed-reward queue
    // =========================
    /// Fallback delay before a reward correction becomes due, used when the
    /// learning state gives no review-date guidance. Floor 60s.
    pub default_reward_delay_ms: u64,

    /// Minimum enforced distance between enqueue time and due time.
    pub min_reward_delay_ms: u64,

    /// Worker wakeup cadence. The worker also wakes immediately after an
    /// enqueue, so this bounds staleness rather than latency.
    pub reward_tick_ms: u64,

    /// Maximum tasks claimed per drain pass.
    ///
    /// Bounds the time a single pass can hold the worker and the blast
    /// radius of a poisoned batch.
    pub reward_claim_batch: usize,

    /// Attempts before a task is parked as FAILED.
    pub reward_max_attempts: u32,

    /// Exponential backoff applied between handler retries.
    pub reward_backoff_base_ms: u64,
    pub reward_backoff_cap_ms: u64,

    /// Per-task handler deadline. A timed-out task returns to PENDING.
    pub reward_handler_timeout_ms: u64,

    // =========================
    // Decision-trace recorder
    // =========================
    /// In-memory trace queue capacity.
    pub trace_queue_capacity: usize,

    /// How long a producer waits on a full queue before the trace is
    /// dropped. The decision path is never blocked longer than this.
    pub trace_backpressure_timeout_ms: u64,

    /// Periodic flush cadence; flushes also run immediately on receipt.
    pub trace_flush_interval_ms: u64,

    /// Traces persisted per flush pass.
    pub trace_max_batch: usize,

    // =========================
    // Monitoring & alerting
    // =========================
    /// Metrics collection / alert evaluation cadence.
    pub metrics_interval_ms: u64,

    /// Sliding window size for decision latencies.
    pub latency_window: usize,

    /// Optional webhook sink for alert notifications.
    pub alert_webhook_url: Option<String>,

    /// Per-call webhook deadline.
    pub webhook_timeout_ms: u64,

    /// Webhook rate limit per channel.
    pub webhook_rate_per_min: u32,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://amas_dev.db".to_string());

        // The delay floor is a contract, not a tunable: rewards that come
        // due faster than 60s race the synchronous pipeline.
        let default_reward_delay_ms = env_u64("DELAYED_REWARD_DELAY_MS", 600_000).max(60_000);

        Self {
            database_url,
            leader: env_bool("AMAS_LEADER", true),

            strategy_cache_ttl_ms: env_u64("STRATEGY_CACHE_TTL_MS", 600_000),
            classify_until: env_u64("COLD_START_CLASSIFY_UNTIL", 15),
            explore_until: env_u64("COLD_START_EXPLORE_UNTIL", 30),

            default_reward_delay_ms,
            min_reward_delay_ms: 60_000,
            reward_tick_ms: env_u64("REWARD_TICK_MS", 60_000),
            reward_claim_batch: env_u64("REWARD_CLAIM_BATCH", 16) as usize,
            reward_max_attempts: env_u64("REWARD_MAX_ATTEMPTS", 5) as u32,
            reward_backoff_base_ms: 50,
            reward_backoff_cap_ms: 60_000,
            reward_handler_timeout_ms: env_u64("REWARD_HANDLER_TIMEOUT_MS", 10_000),

            trace_queue_capacity: env_u64("TRACE_QUEUE_CAPACITY", 1_000) as usize,
            trace_backpressure_timeout_ms: env_u64("TRACE_BACKPRESSURE_TIMEOUT_MS", 5_000),
            trace_flush_interval_ms: env_u64("TRACE_FLUSH_INTERVAL_MS", 1_000),
            trace_max_batch: env_u64("TRACE_MAX_BATCH", 20) as usize,

            metrics_interval_ms: env_u64("METRICS_INTERVAL_MS", 60_000),
            latency_window: env_u64("LATENCY_WINDOW", 1_000) as usize,
            alert_webhook_url: std::env::var("ALERT_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            webhook_timeout_ms: env_u64("ALERT_WEBHOOK_TIMEOUT_MS", 5_000),
            webhook_rate_per_min: env_u64("ALERT_WEBHOOK_RATE_PER_MIN", 12) as u32,
        }
    }
}

impl Default for AppConfig {
    /// Test-friendly defaults; identical to `from_env` with no environment.
    fn default() -> Self {
        Self {
            database_url: "sqlite://amas_dev.db".into(),
            leader: true,
            strategy_cache_ttl_ms: 600_000,
            classify_until: 15,
            explore_until: 30,
            default_reward_delay_ms: 600_000,
            min_reward_delay_ms: 60_000,
            reward_tick_ms: 60_000,
            reward_claim_batch: 16,
            reward_max_attempts: 5,
            reward_backoff_base_ms: 50,
            reward_backoff_cap_ms: 60_000,
            reward_handler_timeout_ms: 10_000,
            trace_queue_capacity: 1_000,
            trace_backpressure_timeout_ms: 5_000,
            trace_flush_interval_ms: 1_000,
            trace_max_batch: 20,
            metrics_interval_ms: 60_000,
            latency_window: 1_000,
            alert_webhook_url: None,
            webhook_timeout_ms: 5_000,
            webhook_rate_per_min: 12,
        }
    }
}
