//! Delayed-reward worker loop.
//!
//! One leader task drains due rows from the durable queue and applies the
//! reward correction to the model. Delivery is at-least-once: a crash
//! between the model update and the status write redelivers the task, and
//! the selector's processed-key marker makes the second apply a no-op.
//!
//! This module never propagates errors: a failing task is retried with
//! exponential backoff and parked as FAILED after the attempt budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::error::AppError;
use crate::features::repository::FeatureRepository;
use crate::monitoring::collector::MetricsCollector;
use crate::rewards::model::DelayedRewardTask;
use crate::rewards::repository::RewardQueueRepository;
use crate::strategy::selector::StrategySelector;
use crate::time::Clock;

#[derive(Clone, Copy, Debug)]
pub struct RewardWorkerConfig {
    pub tick_ms: u64,
    pub claim_batch: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub handler_timeout_ms: u64,
}

impl Default for RewardWorkerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 60_000,
            claim_batch: 16,
            max_attempts: 5,
            backoff_base_ms: 50,
            backoff_cap_ms: 60_000,
            handler_timeout_ms: 10_000,
        }
    }
}

pub struct RewardWorker {
    repo: Arc<dyn RewardQueueRepository>,
    features: Arc<dyn FeatureRepository>,
    selector: Arc<dyn StrategySelector>,
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
    cfg: RewardWorkerConfig,
    wakeup: Arc<Notify>,
}

enum ApplyOutcome {
    Applied,
    /// Duplicate or unattributable: counts as success, nothing to retry.
    Skipped(&'static str),
}

impl RewardWorker {
    pub fn new(
        repo: Arc<dyn RewardQueueRepository>,
        features: Arc<dyn FeatureRepository>,
        selector: Arc<dyn StrategySelector>,
        metrics: Arc<MetricsCollector>,
        clock: Arc<dyn Clock>,
        cfg: RewardWorkerConfig,
        wakeup: Arc<Notify>,
    ) -> Self {
        Self {
            repo,
            features,
            selector,
            metrics,
            clock,
            cfg,
            wakeup,
        }
    }

    /// Leader loop: wakes on the tick cadence or immediately after an
    /// enqueue, drains everything due, repeats until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(component = "reward_worker", event = "startup");
        let mut ticker = tokio::time::interval(Duration::from_millis(self.cfg.tick_ms));

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wakeup.notified() => {}
                _ = shutdown.changed() => break,
            }

            if let Err(e) = self.drain_due().await {
                error!(error = ?e, "reward drain pass failed");
            }
        }

        info!(component = "reward_worker", event = "shutdown");
    }

    /// Claims and processes every currently-due task.
    ///
    /// Tasks are processed sequentially in claim order (due time, then
    /// creation time), which keeps same-user corrections ordered.
    pub async fn drain_due(&self) -> anyhow::Result<()> {
        loop {
            let claimed = self
                .repo
                .claim_due(self.clock.now_ms(), self.cfg.claim_batch)
                .await?;

            if claimed.is_empty() {
                return Ok(());
            }

            debug!(count = claimed.len(), "claimed due reward tasks");
            for task in claimed {
                self.process_task(task).await;
            }
        }
    }

    #[instrument(
        skip(self, task),
        target = "reward_worker",
        fields(task_id = %task.id, user_id = %task.user_id, attempt = task.attempts)
    )]
    async fn process_task(&self, task: DelayedRewardTask) {
        let deadline = Duration::from_millis(self.cfg.handler_timeout_ms);
        let outcome = tokio::time::timeout(deadline, self.apply(&task)).await;

        match outcome {
            Ok(Ok(ApplyOutcome::Applied)) => {
                self.finish_ok(&task).await;
            }
            Ok(Ok(ApplyOutcome::Skipped(reason))) => {
                debug!(reason, "reward task skipped");
                self.finish_ok(&task).await;
            }
            Ok(Err(e)) => {
                if matches!(e, AppError::InvalidInput(_)) {
                    // Invalid rewards are dropped, never retried.
                    self.finish_failed(&task, "INVALID_REWARD").await;
                } else {
                    self.finish_err(&task, &e.to_string()).await;
                }
            }
            Err(_) => {
                self.finish_err(&task, "handler timeout").await;
            }
        }
    }

    async fn apply(&self, task: &DelayedRewardTask) -> Result<ApplyOutcome, AppError> {
        if !task.reward.is_finite() {
            return Err(AppError::invalid("non-finite reward in queue"));
        }

        let reward = if (-1.0..=1.0).contains(&task.reward) {
            task.reward
        } else {
            warn!(reward = task.reward, "delayed reward outside [-1,1]; clamping");
            task.reward.clamp(-1.0, 1.0)
        };

        let Some(session_id) = task.session_id.as_deref() else {
            // No session means no stored features to attribute the reward
            // to; dropping is better than retrying forever.
            return Ok(ApplyOutcome::Skipped("no session id"));
        };

        let vector = self
            .features
            .fetch_latest(session_id)
            .await
            .map_err(AppError::from_store)?
            .ok_or_else(|| AppError::Dependency(format!("no feature vector for {session_id}")))?;

        let applied = self
            .selector
            .update_delayed(&vector, reward, &task.idempotency_key)?;

        if applied {
            Ok(ApplyOutcome::Applied)
        } else {
            Ok(ApplyOutcome::Skipped("idempotency key already processed"))
        }
    }

    async fn finish_ok(&self, task: &DelayedRewardTask) {
        if let Err(e) = self.repo.mark_done(&task.id).await {
            // The model update already happened; redelivery is caught by
            // the selector's processed-key marker.
            error!(task_id = %task.id, error = ?e, "mark_done failed; task will redeliver");
        }
        self.metrics.record_reward(true);
    }

    async fn finish_err(&self, task: &DelayedRewardTask, reason: &str) {
        self.metrics.record_reward(false);

        if task.attempts >= self.cfg.max_attempts {
            warn!(task_id = %task.id, reason, "attempt budget exhausted; parking task");
            if let Err(e) = self.repo.mark_failed(&task.id, reason).await {
                error!(task_id = %task.id, error = ?e, "mark_failed failed");
            }
            return;
        }

        let backoff = self
            .cfg
            .backoff_cap_ms
            .min(self.cfg.backoff_base_ms.saturating_mul(1u64 << task.attempts.min(20)));
        let next_eligible = self.clock.now_ms() + backoff;

        debug!(task_id = %task.id, reason, backoff_ms = backoff, "releasing task for retry");
        if let Err(e) = self
            .repo
            .release_for_retry(&task.id, reason, next_eligible)
            .await
        {
            error!(task_id = %task.id, error = ?e, "release_for_retry failed");
        }
    }

    async fn finish_failed(&self, task: &DelayedRewardTask, reason: &str) {
        self.metrics.record_reward(false);
        if let Err(e) = self.repo.mark_failed(&task.id, reason).await {
            error!(task_id = %task.id, error = ?e, "mark_failed failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::features::model::{FEATURE_LABELS, FEATURE_VERSION, FeatureVector, NORM_METHOD};
    use crate::rewards::model::{NewTask, TaskStatus};
    use crate::rewards::queue::tests::MockRewardRepo;
    use crate::rewards::queue::RewardQueue;
    use crate::strategy::model::{ActionId, Decision, action_params};
    use crate::strategy::phase::ColdStartPhase;
    use crate::time::ManualClock;

    struct MockFeatures {
        vector: Option<FeatureVector>,
        hang: AtomicBool,
    }

    #[async_trait]
    impl FeatureRepository for MockFeatures {
        async fn persist(&self, _v: &FeatureVector) -> anyhow::Result<()> {
            Ok(())
        }
        async fn fetch(
            &self,
            _session_id: &str,
            _version: i64,
        ) -> anyhow::Result<Option<FeatureVector>> {
            Ok(self.vector.clone())
        }
        async fn fetch_latest(&self, _session_id: &str) -> anyhow::Result<Option<FeatureVector>> {
            if self.hang.load(Ordering::SeqCst) {
                // Simulates a stuck store call; the per-task deadline must fire.
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
            Ok(self.vector.clone())
        }
    }

    #[derive(Default)]
    struct MockSelector {
        applied: Mutex<Vec<(String, f64)>>,
        fail: AtomicBool,
    }

    impl StrategySelector for MockSelector {
        fn predict(&self, _features: &FeatureVector, _phase: ColdStartPhase) -> Decision {
            Decision {
                action: ActionId(0),
                params: action_params(ActionId(0)),
                confidence: 0.5,
                weights_snapshot: vec![],
            }
        }
        fn update_realtime(&self, _features: &FeatureVector, _action: ActionId, _reward: f64) {}
        fn update_delayed(
            &self,
            _features: &FeatureVector,
            reward: f64,
            key: &str,
        ) -> Result<bool, AppError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::Dependency("model store offline".into()));
            }
            let mut applied = self.applied.lock();
            if applied.iter().any(|(k, _)| k == key) {
                return Ok(false);
            }
            applied.push((key.to_string(), reward));
            Ok(true)
        }
    }

    fn unit_vector() -> FeatureVector {
        FeatureVector {
            session_id: "s1".into(),
            version: FEATURE_VERSION,
            values: vec![0.5; FEATURE_LABELS.len()],
            labels: FEATURE_LABELS.iter().map(|s| s.to_string()).collect(),
            norm_method: NORM_METHOD.into(),
            ts: 0,
        }
    }

    struct Rig {
        repo: Arc<MockRewardRepo>,
        queue: RewardQueue,
        worker: RewardWorker,
        selector: Arc<MockSelector>,
        metrics: Arc<MetricsCollector>,
        clock: Arc<ManualClock>,
    }

    fn rig(with_vector: bool) -> Rig {
        let repo = Arc::new(MockRewardRepo::default());
        let clock = Arc::new(ManualClock::at(1_000_000));
        let selector = Arc::new(MockSelector::default());
        let metrics = Arc::new(MetricsCollector::new(100));
        let features = Arc::new(MockFeatures {
            vector: with_vector.then(unit_vector),
            hang: AtomicBool::new(false),
        });

        let queue = RewardQueue::new(repo.clone(), clock.clone(), 60_000, 600_000);
        let worker = RewardWorker::new(
            repo.clone(),
            features,
            selector.clone(),
            metrics.clone(),
            clock.clone(),
            RewardWorkerConfig {
                tick_ms: 60_000,
                claim_batch: 4,
                max_attempts: 5,
                backoff_base_ms: 50,
                backoff_cap_ms: 60_000,
                handler_timeout_ms: 10_000,
            },
            queue.wakeup_handle(),
        );

        Rig {
            repo,
            queue,
            worker,
            selector,
            metrics,
            clock,
        }
    }

    fn mk_new(key: &str, due: u64) -> NewTask {
        NewTask {
            user_id: "u1".into(),
            session_id: Some("s1".into()),
            due_ms: due,
            reward: 0.5,
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn due_task_is_applied_and_marked_done() {
        let r = rig(true);
        r.queue.enqueue(mk_new("k1", 1_100_000)).await.unwrap();

        // not yet due: nothing happens
        r.clock.set(1_050_000);
        r.worker.drain_due().await.unwrap();
        assert!(r.selector.applied.lock().is_empty());

        r.clock.set(1_200_000);
        r.worker.drain_due().await.unwrap();

        let rows = r.repo.rows.lock();
        let task = rows.values().next().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(r.selector.applied.lock().len(), 1);
        assert_eq!(
            r.metrics
                .reward_success
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn same_user_tasks_apply_in_due_order() {
        let r = rig(true);
        r.queue.enqueue(mk_new("late", 1_500_000)).await.unwrap();
        r.queue.enqueue(mk_new("early", 1_100_000)).await.unwrap();

        r.clock.set(2_000_000);
        r.worker.drain_due().await.unwrap();

        let applied = r.selector.applied.lock();
        let keys: Vec<&str> = applied.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["early", "late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_failure_backs_off_then_parks_as_failed() {
        let r = rig(true);
        r.selector.fail.store(true, Ordering::SeqCst);
        r.queue.enqueue(mk_new("k1", 1_100_000)).await.unwrap();

        for round in 1..=5u32 {
            // move past any backoff deferral and drain again
            r.clock.advance(120_000_000);
            r.worker.drain_due().await.unwrap();

            let rows = r.repo.rows.lock();
            let task = rows.values().next().unwrap();
            assert_eq!(task.attempts, round);
            if round < 5 {
                assert_eq!(task.status, TaskStatus::Pending);
                assert!(task.next_eligible_ms > 0);
            } else {
                assert_eq!(task.status, TaskStatus::Failed);
            }
            assert!(task.last_error.is_some());
        }

        assert!(r.selector.applied.lock().is_empty(), "no model update on failure");
        assert_eq!(
            r.metrics
                .reward_failure
                .load(std::sync::atomic::Ordering::Relaxed),
            5
        );
        // a later drain finds nothing: FAILED is terminal
        r.clock.advance(120_000_000);
        r.worker.drain_due().await.unwrap();
        assert_eq!(
            r.metrics
                .reward_failure
                .load(std::sync::atomic::Ordering::Relaxed),
            5
        );
    }

    #[tokio::test]
    async fn missing_feature_vector_is_retried_not_dropped() {
        let r = rig(false);
        r.queue.enqueue(mk_new("k1", 1_100_000)).await.unwrap();

        r.clock.set(1_200_000);
        r.worker.drain_due().await.unwrap();

        let rows = r.repo.rows.lock();
        let task = rows.values().next().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.last_error.as_deref().unwrap().contains("feature vector"));
    }

    #[tokio::test]
    async fn task_without_session_completes_without_model_update() {
        let r = rig(true);
        let mut t = mk_new("k1", 1_100_000);
        t.session_id = None;
        r.queue.enqueue(t).await.unwrap();

        r.clock.set(1_200_000);
        r.worker.drain_due().await.unwrap();

        let rows = r.repo.rows.lock();
        assert_eq!(rows.values().next().unwrap().status, TaskStatus::Done);
        assert!(r.selector.applied.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handler_hits_the_per_task_deadline() {
        let repo = Arc::new(MockRewardRepo::default());
        let clock = Arc::new(ManualClock::at(1_000_000));
        let selector = Arc::new(MockSelector::default());
        let metrics = Arc::new(MetricsCollector::new(100));
        let features = Arc::new(MockFeatures {
            vector: Some(unit_vector()),
            hang: AtomicBool::new(true),
        });

        let queue = RewardQueue::new(repo.clone(), clock.clone(), 60_000, 600_000);
        let worker = RewardWorker::new(
            repo.clone(),
            features,
            selector,
            metrics,
            clock.clone(),
            RewardWorkerConfig::default(),
            queue.wakeup_handle(),
        );

        queue
            .enqueue(NewTask {
                user_id: "u1".into(),
                session_id: Some("s1".into()),
                due_ms: 1_100_000,
                reward: 0.5,
                idempotency_key: "k1".into(),
            })
            .await
            .unwrap();

        clock.set(1_200_000);
        worker.drain_due().await.unwrap();

        let rows = repo.rows.lock();
        let task = rows.values().next().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.last_error.as_deref(), Some("handler timeout"));
    }
}
