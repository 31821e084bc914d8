//! Process lifecycle.
//!
//! Start order: store → repositories → selector → pipeline → (leader only)
//! delayed-reward worker, metrics collection, alert evaluation and
//! notification. Non-leader instances serve the decision pipeline but run
//! no background ticks.
//!
//! Shutdown: flip the watch flag, join every worker (the trace recorder
//! performs its final flush on the way out), collect metrics once more,
//! close the pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::db::Db;
use crate::features::model::FEATURE_LABELS;
use crate::features::repository::FeatureRepository;
use crate::features::repository_sqlx::SqlxFeatureRepository;
use crate::monitoring::alerts::{AlertEngine, Severity, default_rules};
use crate::monitoring::collector::{HealthReport, MetricsCollector};
use crate::monitoring::notify::{AlertChannel, ConsoleChannel, Notifier, WebhookChannel};
use crate::pipeline::DecisionPipeline;
use crate::rewards::queue::RewardQueue;
use crate::rewards::repository_sqlx::SqlxRewardQueueRepository;
use crate::rewards::worker::{RewardWorker, RewardWorkerConfig};
use crate::state::repository_sqlx::SqlxStateRepository;
use crate::state::store::StateStore;
use crate::strategy::bandit::LinearBandit;
use crate::strategy::phase::PhaseThresholds;
use crate::strategy::selector::StrategySelector;
use crate::time::{Clock, SystemClock};
use crate::traces::recorder::{RecorderConfig, TraceRecorder};
use crate::traces::repository_sqlx::SqlxTraceRepository;

/// Seed for the selector's exploration stream. Fixed so that a restarted
/// process replays the same decision sequence from the same model state.
const SELECTOR_SEED: u64 = 0x00a3a5;

pub struct App {
    pub pipeline: Arc<DecisionPipeline>,
    pub metrics: Arc<MetricsCollector>,
    pub alerts: Arc<AlertEngine>,
    db: Db,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub async fn start(cfg: AppConfig) -> anyhow::Result<App> {
    let db = Db::connect(&cfg.database_url).await?;
    db.migrate().await?;
    info!(leader = cfg.leader, "store ready");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(MetricsCollector::new(cfg.latency_window));

    let states = Arc::new(StateStore::new(
        Arc::new(SqlxStateRepository::new(db.pool.clone())),
        clock.clone(),
    ));
    let features: Arc<dyn FeatureRepository> =
        Arc::new(SqlxFeatureRepository::new(db.pool.clone()));
    let selector: Arc<dyn StrategySelector> =
        Arc::new(LinearBandit::new(FEATURE_LABELS.len(), SELECTOR_SEED));

    let reward_repo = Arc::new(SqlxRewardQueueRepository::new(db.pool.clone()));
    let rewards = Arc::new(RewardQueue::new(
        reward_repo.clone(),
        clock.clone(),
        cfg.min_reward_delay_ms,
        cfg.default_reward_delay_ms,
    ));

    let (trace_handle, trace_recorder) = TraceRecorder::channel(
        Arc::new(SqlxTraceRepository::new(db.pool.clone())),
        metrics.clone(),
        RecorderConfig {
            capacity: cfg.trace_queue_capacity,
            backpressure_timeout_ms: cfg.trace_backpressure_timeout_ms,
            flush_interval_ms: cfg.trace_flush_interval_ms,
            max_batch: cfg.trace_max_batch,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // The recorder serves the pipeline on every instance.
    tasks.push(tokio::spawn(trace_recorder.run(shutdown_rx.clone())));

    let pipeline = Arc::new(DecisionPipeline::new(
        states,
        features.clone(),
        selector.clone(),
        rewards.clone(),
        trace_handle,
        metrics.clone(),
        clock.clone(),
        PhaseThresholds {
            classify_until: cfg.classify_until,
            explore_until: cfg.explore_until,
        },
        cfg.strategy_cache_ttl_ms,
    ));

    let (alert_tx, alert_rx) = mpsc::unbounded_channel();
    let alerts = Arc::new(AlertEngine::new(default_rules(), alert_tx));

    if cfg.leader {
        let worker = RewardWorker::new(
            reward_repo,
            features,
            selector,
            metrics.clone(),
            clock.clone(),
            RewardWorkerConfig {
                tick_ms: cfg.reward_tick_ms,
                claim_batch: cfg.reward_claim_batch,
                max_attempts: cfg.reward_max_attempts,
                backoff_base_ms: cfg.reward_backoff_base_ms,
                backoff_cap_ms: cfg.reward_backoff_cap_ms,
                handler_timeout_ms: cfg.reward_handler_timeout_ms,
            },
            rewards.wakeup_handle(),
        );
        tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));

        let mut channels: Vec<Arc<dyn AlertChannel>> =
            vec![Arc::new(ConsoleChannel::new(Severity::P3))];
        if let Some(url) = &cfg.alert_webhook_url {
            channels.push(Arc::new(WebhookChannel::new(
                url.clone(),
                Severity::P2,
                cfg.webhook_timeout_ms,
                cfg.webhook_rate_per_min,
                clock.clone(),
            )));
        }
        tasks.push(tokio::spawn(
            Notifier::new(channels, alert_rx).run(shutdown_rx.clone()),
        ));

        tasks.push(tokio::spawn(collection_loop(
            metrics.clone(),
            alerts.clone(),
            clock.clone(),
            Duration::from_millis(cfg.metrics_interval_ms),
            shutdown_rx,
        )));

        info!("background workers started");
    } else {
        info!("non-leader instance; background workers disabled");
    }

    Ok(App {
        pipeline,
        metrics,
        alerts,
        db,
        clock,
        shutdown_tx,
        tasks,
    })
}

/// Leader-only tick: snapshot derived metrics and run them through the
/// alert rules.
async fn collection_loop(
    metrics: Arc<MetricsCollector>,
    alerts: Arc<AlertEngine>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // the immediate first tick would evaluate an empty window
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = clock.now_ms();
                let samples = metrics.collect(now);
                alerts.evaluate_all(&samples, now);
            }
            _ = shutdown.changed() => break,
        }
    }
}

impl App {
    pub fn health(&self) -> HealthReport {
        self.metrics.health()
    }

    /// Graceful stop: workers drain (trace recorder flushes its queue),
    /// metrics are collected one last time, the pool closes.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = ?e, "worker join failed during shutdown");
            }
        }

        let samples = self.metrics.collect(self.clock.now_ms());
        info!(samples = samples.len(), "final metrics collection");

        self.db.close().await;
        info!("store closed");
    }
}
