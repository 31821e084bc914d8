use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::monitoring::window::{SampleWindow, WindowSummary};

/// Metric names exported by the collector.
pub const M_LATENCY_MEAN: &str = "amas.decision.latency_mean";
pub const M_LATENCY_P50: &str = "amas.decision.latency_p50";
pub const M_LATENCY_P95: &str = "amas.decision.latency_p95";
pub const M_LATENCY_P99: &str = "amas.decision.latency_p99";
pub const M_ERROR_RATE: &str = "amas.decision.error_rate";
pub const M_DEGRADATION_RATE: &str = "amas.decision.degradation_rate";
pub const M_TIMEOUT_RATE: &str = "amas.decision.timeout_rate";
pub const M_CIRCUIT_OPEN_RATE: &str = "amas.circuit.open_rate";
pub const M_REWARD_FAILURE_RATE: &str = "amas.reward.failure_rate";

#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub ts_ms: u64,
    pub labels: HashMap<String, String>,
}

impl MetricSample {
    pub fn new(name: &str, value: f64, ts_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            value,
            ts_ms,
            labels: HashMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthReport {
    pub decision: HealthStatus,
    pub circuit: HealthStatus,
    pub reward: HealthStatus,
    pub overall: HealthStatus,
}

/// Process-local metrics for the decision pipeline and its workers.
///
/// Counters are atomic so any lane may record; the latency window is
/// lock-guarded. Derived rates are computed on collection and a rate whose
/// denominator is zero is omitted, never emitted as zero.
pub struct MetricsCollector {
    pub success: AtomicU64,
    pub error: AtomicU64,
    pub degradation: AtomicU64,
    pub timeout: AtomicU64,

    pub circuit_open: AtomicU64,
    pub circuit_check: AtomicU64,

    pub reward_success: AtomicU64,
    pub reward_failure: AtomicU64,

    pub backpressure_timeout: AtomicU64,

    latencies: Mutex<SampleWindow>,
}

impl MetricsCollector {
    pub fn new(latency_window: usize) -> Self {
        Self {
            success: AtomicU64::new(0),
            error: AtomicU64::new(0),
            degradation: AtomicU64::new(0),
            timeout: AtomicU64::new(0),
            circuit_open: AtomicU64::new(0),
            circuit_check: AtomicU64::new(0),
            reward_success: AtomicU64::new(0),
            reward_failure: AtomicU64::new(0),
            backpressure_timeout: AtomicU64::new(0),
            latencies: Mutex::new(SampleWindow::new(latency_window)),
        }
    }

    pub fn record_decision(&self, latency_ms: f64, ok: bool) {
        self.latencies.lock().push(latency_ms);
        if ok {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_timeout(&self) {
        self.timeout.fetch_add(1, Ordering::Relaxed);
        self.error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degradation(&self) {
        self.degradation.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit(&self, open: bool) {
        self.circuit_check.fetch_add(1, Ordering::Relaxed);
        if open {
            self.circuit_open.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reward(&self, ok: bool) {
        if ok {
            self.reward_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reward_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_backpressure_timeout(&self) {
        self.backpressure_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn latency_summary(&self) -> Option<WindowSummary> {
        self.latencies.lock().summary()
    }

    fn rate(num: u64, den: u64) -> Option<f64> {
        if den == 0 {
            None
        } else {
            Some(num as f64 / den as f64)
        }
    }

    /// One collection tick: latency aggregates plus derived rates.
    pub fn collect(&self, now_ms: u64) -> Vec<MetricSample> {
        let mut out = Vec::new();

        if let Some(s) = self.latency_summary() {
            out.push(MetricSample::new(M_LATENCY_MEAN, s.mean, now_ms));
            out.push(MetricSample::new(M_LATENCY_P50, s.p50, now_ms));
            out.push(MetricSample::new(M_LATENCY_P95, s.p95, now_ms));
            out.push(MetricSample::new(M_LATENCY_P99, s.p99, now_ms));
        }

        let success = self.success.load(Ordering::Relaxed);
        let error = self.error.load(Ordering::Relaxed);
        let decisions = success + error;

        if let Some(r) = Self::rate(error, decisions) {
            out.push(MetricSample::new(M_ERROR_RATE, r, now_ms));
        }
        if let Some(r) = Self::rate(self.degradation.load(Ordering::Relaxed), decisions) {
            out.push(MetricSample::new(M_DEGRADATION_RATE, r, now_ms));
        }
        if let Some(r) = Self::rate(self.timeout.load(Ordering::Relaxed), decisions) {
            out.push(MetricSample::new(M_TIMEOUT_RATE, r, now_ms));
        }
        if let Some(r) = Self::rate(
            self.circuit_open.load(Ordering::Relaxed),
            self.circuit_check.load(Ordering::Relaxed),
        ) {
            out.push(MetricSample::new(M_CIRCUIT_OPEN_RATE, r, now_ms));
        }

        let reward_ok = self.reward_success.load(Ordering::Relaxed);
        let reward_fail = self.reward_failure.load(Ordering::Relaxed);
        if let Some(r) = Self::rate(reward_fail, reward_ok + reward_fail) {
            out.push(MetricSample::new(M_REWARD_FAILURE_RATE, r, now_ms));
        }

        out
    }

    /// Component statuses by layered thresholds; overall is the worst one.
    pub fn health(&self) -> HealthReport {
        let success = self.success.load(Ordering::Relaxed);
        let error = self.error.load(Ordering::Relaxed);
        let error_rate = Self::rate(error, success + error).unwrap_or(0.0);
        let p95 = self.latency_summary().map(|s| s.p95).unwrap_or(0.0);

        let decision = if error_rate > 0.05 || p95 > 500.0 {
            HealthStatus::Unhealthy
        } else if error_rate > 0.01 || p95 > 200.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let open_rate = Self::rate(
            self.circuit_open.load(Ordering::Relaxed),
            self.circuit_check.load(Ordering::Relaxed),
        )
        .unwrap_or(0.0);
        let circuit = if open_rate > 0.5 {
            HealthStatus::Unhealthy
        } else if open_rate > 0.3 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let reward_ok = self.reward_success.load(Ordering::Relaxed);
        let reward_fail = self.reward_failure.load(Ordering::Relaxed);
        let fail_rate = Self::rate(reward_fail, reward_ok + reward_fail).unwrap_or(0.0);
        let reward = if fail_rate > 0.5 {
            HealthStatus::Unhealthy
        } else if fail_rate > 0.2 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            decision,
            circuit,
            reward,
            overall: decision.max(circuit).max(reward),
        }
    }

    /// Zeroes everything. Test hook only.
    pub fn reset(&self) {
        for c in [
            &self.success,
            &self.error,
            &self.degradation,
            &self.timeout,
            &self.circuit_open,
            &self.circuit_check,
            &self.reward_success,
            &self.reward_failure,
            &self.backpressure_timeout,
        ] {
            c.store(0, Ordering::Relaxed);
        }
        self.latencies.lock().clear();
    }
}
