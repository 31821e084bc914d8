use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber: pretty output for development, JSON
/// lines when running behind a log collector.
///
/// Span-close events are enabled so the `#[instrument]` spans on the
/// pipeline, stores and workers report their duration without extra code.
/// sqlx statement logging is capped at warn; per-query noise drowns the
/// decision path otherwise.
pub fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let base = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(fmt::format::FmtSpan::CLOSE);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(base.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(base.pretty())
            .init();
    }
}

/// Awaits a store call and warns when it blows its latency budget.
///
/// The decision path stays on the caller's deadline either way; this only
/// makes the slow dependency visible before the deadline starts tripping.
pub async fn warn_if_slow<F, T>(op: &'static str, budget: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = std::time::Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > budget {
        tracing::warn!(
            target: "slow_op",
            op,
            elapsed_ms = elapsed.as_millis() as u64,
            budget_ms = budget.as_millis() as u64,
            "store call exceeded its latency budget"
        );
    }
    out
}
