//! Threshold alerting over collected metric samples.
//!
//! Each rule carries duration and cooldown semantics and walks the
//! incident state machine `pending → firing → resolved`. A resolved
//! incident is terminal; the next breach opens a new incident with a new
//! id. Evaluation runs on a single loop per process, so no rule is ever
//! evaluated concurrently.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::monitoring::collector::{
    M_CIRCUIT_OPEN_RATE, M_ERROR_RATE, M_LATENCY_P99, M_REWARD_FAILURE_RATE, MetricSample,
};
use crate::time::new_id;

/// Retained resolved/fired alerts.
const HISTORY_CAP: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    P0,
    P1,
    P2,
    P3,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::P0 => "P0",
            Severity::P1 => "P1",
            Severity::P2 => "P2",
            Severity::P3 => "P3",
        }
    }

    /// True when `self` is at least as severe as `min`.
    pub fn passes(&self, min: Severity) -> bool {
        *self <= min
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl CmpOp {
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            CmpOp::Gt => value > threshold,
            CmpOp::Ge => value >= threshold,
            CmpOp::Lt => value < threshold,
            CmpOp::Le => value <= threshold,
            CmpOp::Eq => value == threshold,
            CmpOp::Ne => value != threshold,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AlertRule {
    pub name: String,
    pub metric: String,
    pub op: CmpOp,
    pub threshold: f64,
    pub duration_secs: u64,
    pub cooldown_secs: u64,
    pub severity: Severity,
    pub enabled: bool,
    pub labels: HashMap<String, String>,
    pub message_template: String,
    /// When set, fire after this many consecutive exceeded evaluations
    /// instead of accumulated wall time.
    pub consecutive_periods: Option<u32>,
}

impl AlertRule {
    fn render_message(&self, value: f64) -> String {
        self.message_template
            .replace("{rule}", &self.name)
            .replace("{metric}", &self.metric)
            .replace("{value}", &format!("{value:.4}"))
            .replace("{threshold}", &format!("{:.4}", self.threshold))
    }
}

/// Operator defaults; every field is overridable via rule config.
pub fn default_rules() -> Vec<AlertRule> {
    let rule = |name: &str, metric: &str, threshold: f64, severity: Severity| AlertRule {
        name: name.to_string(),
        metric: metric.to_string(),
        op: CmpOp::Gt,
        threshold,
        duration_secs: 120,
        cooldown_secs: 300,
        severity,
        enabled: true,
        labels: HashMap::new(),
        message_template: format!("{metric} = {{value}} breached {{threshold}}"),
        consecutive_periods: None,
    };

    vec![
        rule("decision_latency_p99_high", M_LATENCY_P99, 200.0, Severity::P1),
        rule("decision_error_rate_high", M_ERROR_RATE, 0.1, Severity::P1),
        rule("circuit_open_rate_high", M_CIRCUIT_OPEN_RATE, 0.3, Severity::P2),
        rule("reward_failure_rate_high", M_REWARD_FAILURE_RATE, 0.5, Severity::P2),
    ]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Firing,
    Resolved,
}

#[derive(Clone, Debug)]
pub struct Alert {
    pub id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub value: f64,
    pub threshold: f64,
    pub fired_ms: Option<u64>,
    pub resolved_ms: Option<u64>,
    pub last_update_ms: u64,
    pub message: String,
    pub labels: HashMap<String, String>,
}

#[derive(Default)]
struct RuleState {
    alert: Option<Alert>,
    exceed_ms: u64,
    consecutive: u32,
    last_fired_ms: Option<u64>,
    last_check_ms: Option<u64>,
}

pub struct AlertEngine {
    rules: Vec<AlertRule>,
    states: Mutex<HashMap<String, RuleState>>,
    history: Mutex<VecDeque<Alert>>,
    notify_tx: mpsc::UnboundedSender<Alert>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>, notify_tx: mpsc::UnboundedSender<Alert>) -> Self {
        Self {
            rules,
            states: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            notify_tx,
        }
    }

    pub fn evaluate_all(&self, samples: &[MetricSample], now_ms: u64) {
        for sample in samples {
            self.evaluate_sample(sample, now_ms);
        }
    }

    pub fn evaluate_sample(&self, sample: &MetricSample, now_ms: u64) {
        for rule in self.rules.iter().filter(|r| r.enabled) {
            if rule.metric == sample.name {
                self.evaluate_rule(rule, sample.value, now_ms);
            }
        }
    }

    fn evaluate_rule(&self, rule: &AlertRule, value: f64, now_ms: u64) {
        let mut states = self.states.lock();
        let state = states.entry(rule.name.clone()).or_default();

        let exceeded = rule.op.compare(value, rule.threshold);

        if exceeded {
            if let Some(last) = state.last_check_ms {
                state.exceed_ms += now_ms.saturating_sub(last);
            }
            state.consecutive += 1;

            let currently_firing = state
                .alert
                .as_ref()
                .map(|a| a.status == AlertStatus::Firing)
                .unwrap_or(false);

            if state.alert.is_none() {
                state.alert = Some(Alert {
                    id: new_id(),
                    rule_name: rule.name.clone(),
                    severity: rule.severity,
                    status: AlertStatus::Pending,
                    value,
                    threshold: rule.threshold,
                    fired_ms: None,
                    resolved_ms: None,
                    last_update_ms: now_ms,
                    message: rule.render_message(value),
                    labels: rule.labels.clone(),
                });
            }

            let duration_met = match rule.consecutive_periods {
                Some(n) => state.consecutive >= n,
                None => state.exceed_ms >= rule.duration_secs * 1_000,
            };
            let cooldown_passed = state
                .last_fired_ms
                .map(|t| now_ms.saturating_sub(t) >= rule.cooldown_secs * 1_000)
                .unwrap_or(true);

            if let Some(alert) = state.alert.as_mut() {
                if duration_met && cooldown_passed && !currently_firing {
                    alert.status = AlertStatus::Firing;
                    alert.fired_ms = Some(now_ms);
                    alert.value = value;
                    alert.last_update_ms = now_ms;
                    alert.message = rule.render_message(value);
                    state.last_fired_ms = Some(now_ms);
                    state.last_check_ms = Some(now_ms);

                    let fired = alert.clone();
                    drop(states);

                    tracing::warn!(
                        rule = %rule.name,
                        severity = %rule.severity.as_str(),
                        value,
                        threshold = rule.threshold,
                        "alert firing"
                    );
                    self.push_history(fired.clone());
                    let _ = self.notify_tx.send(fired);
                    return;
                }

                alert.value = value;
                alert.last_update_ms = now_ms;
            }
            state.last_check_ms = Some(now_ms);
        } else {
            state.exceed_ms = 0;
            state.consecutive = 0;
            state.last_check_ms = Some(now_ms);

            match state.alert.take() {
                Some(mut alert) if alert.status == AlertStatus::Firing => {
                    alert.status = AlertStatus::Resolved;
                    alert.resolved_ms = Some(now_ms);
                    alert.last_update_ms = now_ms;

                    let resolved = alert.clone();
                    drop(states);

                    tracing::info!(rule = %rule.name, "alert resolved");
                    self.push_history(resolved.clone());
                    let _ = self.notify_tx.send(resolved);
                }
                // A pending incident that never fired recovers silently.
                _ => {}
            }
        }
    }

    fn push_history(&self, alert: Alert) {
        let mut h = self.history.lock();
        if h.len() == HISTORY_CAP {
            h.pop_front();
        }
        h.push_back(alert);
    }

    /// Pending and firing incidents.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.states
            .lock()
            .values()
            .filter_map(|s| s.alert.clone())
            .collect()
    }

    pub fn history(&self) -> Vec<Alert> {
        self.history.lock().iter().cloned().collect()
    }
}
