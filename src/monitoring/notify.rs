//! Alert notification fan-out.
//!
//! Dispatch is decoupled from rule evaluation through an unbounded channel
//! consumed by a single notifier task, so a slow webhook can never stall
//! the evaluation loop. Channels filter by minimum severity; the webhook
//! channel is token-bucket rate-limited and retried on failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::monitoring::alerts::{Alert, AlertStatus, Severity};
use crate::time::Clock;

const WEBHOOK_MAX_ATTEMPTS: u32 = 3;
const WEBHOOK_RETRY_BASE_MS: u64 = 100;

#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;
    fn min_severity(&self) -> Severity;
    async fn send(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Writes one colored line per event to stderr.
pub struct ConsoleChannel {
    min_severity: Severity,
}

impl ConsoleChannel {
    pub fn new(min_severity: Severity) -> Self {
        Self { min_severity }
    }

    fn color(severity: Severity) -> &'static str {
        match severity {
            Severity::P0 => "\x1b[1;31m",
            Severity::P1 => "\x1b[31m",
            Severity::P2 => "\x1b[33m",
            Severity::P3 => "\x1b[36m",
        }
    }
}

#[async_trait]
impl AlertChannel for ConsoleChannel {
    fn name(&self) -> &'static str {
        "console"
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        let color = Self::color(alert.severity);
        let status = match alert.status {
            AlertStatus::Pending => "PENDING",
            AlertStatus::Firing => "FIRING",
            AlertStatus::Resolved => "RESOLVED",
        };
        eprintln!(
            "{color}[{} {}]\x1b[0m {}: {}",
            alert.severity.as_str(),
            status,
            alert.rule_name,
            alert.message
        );
        Ok(())
    }
}

/// Simple token bucket; refills continuously at `per_minute / 60s`.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_ms: f64,
    last_ms: u64,
}

impl TokenBucket {
    fn new(per_minute: u32, now_ms: u64) -> Self {
        let capacity = per_minute.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_ms: capacity / 60_000.0,
            last_ms: now_ms,
        }
    }

    fn allow(&mut self, now_ms: u64) -> bool {
        let elapsed = now_ms.saturating_sub(self.last_ms) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_ms).min(self.capacity);
        self.last_ms = now_ms;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// POSTs the raw alert payload as JSON.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
    min_severity: Severity,
    bucket: Mutex<TokenBucket>,
    clock: Arc<dyn Clock>,
}

impl WebhookChannel {
    pub fn new(
        url: String,
        min_severity: Severity,
        timeout_ms: u64,
        rate_per_min: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        let now = clock.now_ms();
        Self {
            url,
            client,
            min_severity,
            bucket: Mutex::new(TokenBucket::new(rate_per_min, now)),
            clock,
        }
    }

    fn payload(alert: &Alert) -> serde_json::Value {
        let iso = |ms: u64| {
            chrono::DateTime::from_timestamp_millis(ms as i64)
                .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        };

        serde_json::json!({
            "id": alert.id,
            "ruleName": alert.rule_name,
            "severity": alert.severity.as_str(),
            "status": match alert.status {
                AlertStatus::Pending => "pending",
                AlertStatus::Firing => "firing",
                AlertStatus::Resolved => "resolved",
            },
            "message": alert.message,
            "value": alert.value,
            "threshold": alert.threshold,
            "labels": alert.labels.clone(),
            "firedAt": alert.fired_ms.and_then(iso),
            "resolvedAt": alert.resolved_ms.and_then(iso),
        })
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        if !self.bucket.lock().allow(self.clock.now_ms()) {
            tracing::warn!(
                rule = %alert.rule_name,
                "webhook rate limit reached; dropping notification"
            );
            return Ok(());
        }

        let body = Self::payload(alert);
        let resp = self.client.post(&self.url).json(&body).send().await?;
        resp.error_for_status()?;
        Ok(())
    }
}

/// Single consumer of the alert event channel.
pub struct Notifier {
    channels: Vec<Arc<dyn AlertChannel>>,
    rx: mpsc::UnboundedReceiver<Alert>,
}

impl Notifier {
    pub fn new(
        channels: Vec<Arc<dyn AlertChannel>>,
        rx: mpsc::UnboundedReceiver<Alert>,
    ) -> Self {
        Self { channels, rx }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(alert) => self.dispatch(&alert).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("notifier stopped");
    }

    async fn dispatch(&self, alert: &Alert) {
        for channel in &self.channels {
            if !alert.severity.passes(channel.min_severity()) {
                continue;
            }

            let mut attempt: u32 = 0;
            loop {
                match channel.send(alert).await {
                    Ok(()) => break,
                    Err(e) if attempt + 1 < WEBHOOK_MAX_ATTEMPTS => {
                        attempt += 1;
                        tracing::warn!(
                            channel = channel.name(),
                            rule = %alert.rule_name,
                            attempt,
                            error = %e,
                            "notification failed; retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(
                            WEBHOOK_RETRY_BASE_MS << attempt,
                        ))
                        .await;
                    }
                    Err(e) => {
                        tracing::error!(
                            channel = channel.name(),
                            rule = %alert.rule_name,
                            error = %e,
                            "notification dropped after retries"
                        );
                        break;
                    }
                }
            }
        }
    }
}
