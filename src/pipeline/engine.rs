//! Per-event decision pipeline.
//!
//! `process_event` turns one interaction event into an updated cognitive
//! state, a selected strategy and a scalar reward, then schedules the
//! delayed-reward correction and the decision trace.
//!
//! Concurrency: calls for the same user are serialized behind a keyed
//! async mutex for the whole read-compute-write section; different users
//! proceed in parallel. No global lock.
//!
//! Failure semantics: state persistence failure aborts the event and
//! surfaces; scheduling failures (reward task, trace) are logged and
//! swallowed so the primary response always wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument, warn};

use crate::error::AppError;
use crate::features::extractor;
use crate::features::model::FeatureVector;
use crate::features::repository::FeatureRepository;
use crate::monitoring::collector::MetricsCollector;
use crate::pipeline::reward::{immediate_reward, score_event};
use crate::rewards::model::{DelayedRewardTask, NewTask};
use crate::rewards::queue::RewardQueue;
use crate::state::model::{AnswerRecord, RawEvent, UserState};
use crate::state::store::StateStore;
use crate::state::update::{apply_event, speed_score, update_word};
use crate::strategy::cache::StrategyCache;
use crate::strategy::model::{Difficulty, StrategyParams};
use crate::strategy::phase::{ColdStartPhase, PhaseThresholds, phase_for};
use crate::strategy::selector::StrategySelector;
use crate::time::{Clock, new_id};
use crate::traces::model::{DecisionTrace, IngestionStatus, StageRecord};
use crate::traces::recorder::TraceHandle;

/// Fatigue level above which the user is told to take a break.
const BREAK_FATIGUE: f64 = 0.8;
/// Recent accuracy below which the user is told to take a break.
const BREAK_ACCURACY: f64 = 0.3;

#[derive(Clone, Debug, Serialize)]
pub struct Factor {
    pub name: String,
    pub value: f64,
    pub impact: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct Explanation {
    pub text: String,
    pub factors: Vec<Factor>,
}

#[derive(Clone, Debug)]
pub struct ProcessResult {
    pub state: UserState,
    pub strategy: StrategyParams,
    pub reward: f64,
    pub feature_vector: Option<FeatureVector>,
    pub should_break: bool,
    pub phase: ColdStartPhase,
    pub explanation: Explanation,
}

pub struct DecisionPipeline {
    states: Arc<StateStore>,
    features: Arc<dyn FeatureRepository>,
    selector: Arc<dyn StrategySelector>,
    cache: StrategyCache,
    rewards: Arc<RewardQueue>,
    traces: TraceHandle,
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
    phases: PhaseThresholds,
    user_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DecisionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        states: Arc<StateStore>,
        features: Arc<dyn FeatureRepository>,
        selector: Arc<dyn StrategySelector>,
        rewards: Arc<RewardQueue>,
        traces: TraceHandle,
        metrics: Arc<MetricsCollector>,
        clock: Arc<dyn Clock>,
        phases: PhaseThresholds,
        cache_ttl_ms: u64,
    ) -> Self {
        Self {
            states,
            features,
            selector,
            cache: StrategyCache::new(cache_ttl_ms),
            rewards,
            traces,
            metrics,
            clock,
            phases,
            user_locks: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn acquire_user_lock(&self, user_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.user_locks.lock().await;

        // Prune entries nobody holds: strong_count == 1 means only the map
        // still references the lock.
        if locks.len() > 1_000 {
            locks.retain(|_, v| Arc::strong_count(v) > 1);
        }

        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Processes one event end to end.
    pub async fn process_event(
        &self,
        user_id: &str,
        event: RawEvent,
        session_id: Option<String>,
    ) -> Result<ProcessResult, AppError> {
        let start = std::time::Instant::now();
        let result = self.process_inner(user_id, event, session_id).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1_000.0;
        self.metrics.record_decision(latency_ms, result.is_ok());
        result
    }

    /// Deadline-bounded variant. On a miss nothing is persisted and the
    /// timeout is recorded.
    pub async fn process_event_with_deadline(
        &self,
        user_id: &str,
        event: RawEvent,
        session_id: Option<String>,
        deadline: Duration,
    ) -> Result<ProcessResult, AppError> {
        let start = std::time::Instant::now();
        match tokio::time::timeout(deadline, self.process_inner(user_id, event, session_id)).await
        {
            Ok(result) => {
                let latency_ms = start.elapsed().as_secs_f64() * 1_000.0;
                self.metrics.record_decision(latency_ms, result.is_ok());
                result
            }
            Err(_) => {
                self.metrics.record_timeout();
                Err(AppError::Timeout(format!(
                    "decision deadline of {}ms exceeded",
                    deadline.as_millis()
                )))
            }
        }
    }

    #[instrument(skip(self, event, session_id), target = "pipeline", fields(user_id = %user_id))]
    async fn process_inner(
        &self,
        user_id: &str,
        event: RawEvent,
        session_id: Option<String>,
    ) -> Result<ProcessResult, AppError> {
        let now = self.clock.now_ms();
        event.validate(now)?;

        let user_lock = self.acquire_user_lock(user_id).await;
        let _guard = user_lock.lock().await;

        let mut stages: Vec<StageRecord> = Vec::new();

        let prev = self
            .staged(&mut stages, "load_state", self.states.load_or_init(user_id))
            .await?;

        let stats = self
            .staged(&mut stages, "derive_stats", self.states.derive_stats(&prev))
            .await?;

        let next = {
            let t0 = self.clock.now_ms();
            let next = apply_event(&prev, &event, &stats, now);
            stages.push(StageRecord::ok("update_state", t0, self.clock.now_ms()));
            next
        };
        let stability_delta = next.cognitive.stability - prev.cognitive.stability;

        // Feature extraction is pure; persistence happens only when the
        // caller supplied a session and must not sink the decision.
        let t0 = self.clock.now_ms();
        let vector = extractor::extract(
            &event,
            &next,
            &stats,
            session_id.as_deref().unwrap_or(user_id),
            now,
        );
        let stored_vector = if let Some(sid) = session_id.as_deref() {
            match self.features.persist(&vector).await {
                Ok(()) => Some(vector.clone()),
                Err(e) => {
                    warn!(session_id = %sid, error = %e, "feature vector persist failed");
                    None
                }
            }
        } else {
            None
        };
        stages.push(StageRecord::ok("extract_features", t0, self.clock.now_ms()));

        let phase = phase_for(stats.interaction_count, &self.phases);
        let decision = {
            let t0 = self.clock.now_ms();
            let d = self.selector.predict(&vector, phase);
            stages.push(StageRecord::ok("select_strategy", t0, self.clock.now_ms()));
            d
        };

        let reward = immediate_reward(
            event.is_correct,
            speed_score(event.response_time_ms),
            stability_delta,
        );
        {
            let t0 = self.clock.now_ms();
            self.selector.update_realtime(&vector, decision.action, reward);
            stages.push(StageRecord::ok("realtime_update", t0, self.clock.now_ms()));
        }

        let prev_word = self
            .states
            .word_state(user_id, &event.word_id)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "word state read failed; starting fresh");
                None
            });
        let word = update_word(prev_word, &event, user_id, now);

        let answer = AnswerRecord {
            id: new_id(),
            user_id: user_id.to_string(),
            word_id: event.word_id.clone(),
            is_correct: event.is_correct,
            response_time_ms: event.response_time_ms,
            timestamp_ms: event.timestamp_ms,
        };

        self.staged(
            &mut stages,
            "persist",
            self.states.persist(&next, &answer, &word),
        )
        .await?;

        self.cache.put(user_id, decision.params.clone(), now);

        // Side effects: failures are logged, never surfaced.
        let idempotency_key = format!("{user_id}:{}:{}", event.word_id, event.timestamp_ms);
        let due_ms = self.rewards.compute_due(Some(&word), event.timestamp_ms);
        if let Err(e) = self
            .rewards
            .enqueue(NewTask {
                user_id: user_id.to_string(),
                session_id: session_id.clone(),
                due_ms,
                reward,
                idempotency_key,
            })
            .await
        {
            warn!(error = %e, "delayed reward scheduling failed; decision unaffected");
        }

        let should_break = next.fatigue > BREAK_FATIGUE
            || stats
                .recent_accuracy
                .map(|a| a < BREAK_ACCURACY)
                .unwrap_or(false);

        let explanation = self.build_explanation(&event, &next, &decision.params, phase);

        let decision_source = match phase {
            ColdStartPhase::Normal => "bandit",
            _ => "coldstart",
        };
        let trace = DecisionTrace {
            decision_id: new_id(),
            answer_record_id: Some(answer.id.clone()),
            session_id: session_id.clone(),
            timestamp_ms: now,
            decision_source: decision_source.to_string(),
            weights_snapshot: Some(decision.weights_json()),
            selected_action: serde_json::to_value(&decision.params)
                .unwrap_or_else(|_| serde_json::json!({})),
            confidence: decision.confidence,
            reward: Some(reward),
            stages,
            ingestion_status: IngestionStatus::Success,
        };
        self.traces.record(trace).await;

        debug!(
            reward,
            phase = phase.as_str(),
            should_break,
            "decision complete"
        );

        Ok(ProcessResult {
            state: next,
            strategy: decision.params,
            reward,
            feature_vector: stored_vector,
            should_break,
            phase,
            explanation,
        })
    }

    async fn staged<T, F>(
        &self,
        stages: &mut Vec<StageRecord>,
        name: &str,
        fut: F,
    ) -> Result<T, AppError>
    where
        F: std::future::Future<Output = Result<T, AppError>>,
    {
        let t0 = self.clock.now_ms();
        match fut.await {
            Ok(v) => {
                stages.push(StageRecord::ok(name, t0, self.clock.now_ms()));
                Ok(v)
            }
            Err(e) => {
                stages.push(StageRecord::failed(
                    name,
                    t0,
                    self.clock.now_ms(),
                    e.to_string(),
                ));
                Err(e)
            }
        }
    }

    fn build_explanation(
        &self,
        event: &RawEvent,
        state: &UserState,
        params: &StrategyParams,
        phase: ColdStartPhase,
    ) -> Explanation {
        let score = score_event(
            event.is_correct,
            event.response_time_ms,
            state.cognitive.stability,
            state.cognitive.mem,
        );

        let impact_of = |v: f64, high_is_bad: bool| {
            let high = v > 0.7;
            match (high, high_is_bad) {
                (true, true) => "negative",
                (true, false) => "positive",
                _ => "neutral",
            }
            .to_string()
        };

        let factors = vec![
            Factor {
                name: "fatigue".into(),
                value: state.fatigue,
                impact: impact_of(state.fatigue, true),
            },
            Factor {
                name: "attention".into(),
                value: state.attention,
                impact: impact_of(state.attention, false),
            },
            Factor {
                name: "motivation".into(),
                value: state.motivation,
                impact: impact_of(state.motivation, false),
            },
            Factor {
                name: "answer_score".into(),
                value: score.total as f64,
                impact: "neutral".into(),
            },
        ];

        Explanation {
            text: format!(
                "{} difficulty, {:.0}% new words, batches of {} ({})",
                params.difficulty.as_str(),
                params.new_ratio * 100.0,
                params.batch_size,
                phase.description()
            ),
            factors,
        }
    }

    /// Live state, or first-event defaults for an unknown user.
    pub async fn get_state(&self, user_id: &str) -> Result<UserState, AppError> {
        self.states.load_or_init(user_id).await
    }

    /// Cached strategy when fresh, else a state-derived fallback.
    pub async fn get_strategy(&self, user_id: &str) -> Result<StrategyParams, AppError> {
        let now = self.clock.now_ms();
        if let Some(params) = self.cache.get(user_id, now) {
            return Ok(params);
        }
        let state = self.states.load_or_init(user_id).await?;
        Ok(strategy_from_state(&state))
    }

    pub async fn get_phase(&self, user_id: &str) -> Result<ColdStartPhase, AppError> {
        let state = self.states.load_or_init(user_id).await?;
        Ok(phase_for(state.interaction_count, &self.phases))
    }

    /// Destroys the user's state and cached strategy.
    pub async fn reset_user(&self, user_id: &str) -> Result<(), AppError> {
        self.states.reset(user_id).await?;
        self.cache.invalidate(user_id);
        Ok(())
    }

    /// Manual reward correction. Enqueued like any other delayed reward
    /// (minimum delay enforced, idempotent on the caller's key) so the
    /// worker applies it with the usual ordering and retry guarantees.
    pub async fn apply_delayed_reward(
        &self,
        user_id: &str,
        session_id: Option<String>,
        reward: f64,
        idempotency_key: String,
    ) -> Result<DelayedRewardTask, AppError> {
        self.rewards
            .enqueue(NewTask {
                user_id: user_id.to_string(),
                session_id,
                due_ms: self.clock.now_ms(),
                reward,
                idempotency_key,
            })
            .await
    }

    /// Sequential replay of a batch of events. Individual failures are
    /// skipped; the count and the last successful result are returned.
    pub async fn batch_process(
        &self,
        user_id: &str,
        events: Vec<RawEvent>,
        session_id: Option<String>,
    ) -> Result<(usize, Option<ProcessResult>), AppError> {
        let mut processed = 0usize;
        let mut last = None;

        for event in events {
            match self.process_event(user_id, event, session_id.clone()).await {
                Ok(result) => {
                    processed += 1;
                    last = Some(result);
                }
                Err(e) => {
                    warn!(user_id, error = %e, "batch event skipped");
                }
            }
        }

        Ok((processed, last))
    }
}

/// Fallback strategy when no decision is cached: defaults shaped by the
/// live state.
fn strategy_from_state(state: &UserState) -> StrategyParams {
    let mut params = StrategyParams::default();

    if state.fatigue > 0.7 {
        params.difficulty = Difficulty::Easy;
        params.batch_size = 5;
        params.new_ratio = 0.1;
        params.hint_level = 2;
    } else if state.motivation > 0.7 && state.cognitive.mem > 0.6 {
        params.difficulty = Difficulty::Hard;
        params.new_ratio = 0.3;
    }

    params.constrained()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::watch;

    use crate::monitoring::collector::MetricsCollector;
    use crate::rewards::model::TaskStatus;
    use crate::rewards::queue::tests::MockRewardRepo;
    use crate::rewards::repository::RewardQueueRepository;
    use crate::state::model::WordState;
    use crate::state::repository::StateRepository;
    use crate::state::store::tests::MockStateRepository;
    use crate::strategy::bandit::LinearBandit;
    use crate::time::ManualClock;
    use crate::traces::recorder::tests::MockTraceRepo;
    use crate::traces::recorder::{RecorderConfig, TraceRecorder};

    #[derive(Default)]
    struct MemFeatureRepo {
        rows: Mutex<HashMap<(String, i64), FeatureVector>>,
    }

    #[async_trait]
    impl FeatureRepository for MemFeatureRepo {
        async fn persist(&self, v: &FeatureVector) -> anyhow::Result<()> {
            self.rows
                .lock()
                .entry((v.session_id.clone(), v.version))
                .or_insert_with(|| v.clone());
            Ok(())
        }
        async fn fetch(&self, s: &str, version: i64) -> anyhow::Result<Option<FeatureVector>> {
            Ok(self.rows.lock().get(&(s.to_string(), version)).cloned())
        }
        async fn fetch_latest(&self, s: &str) -> anyhow::Result<Option<FeatureVector>> {
            Ok(self
                .rows
                .lock()
                .iter()
                .filter(|((sid, _), _)| sid == s)
                .max_by_key(|((_, v), _)| *v)
                .map(|(_, v)| v.clone()))
        }
    }

    const T0: u64 = 1_700_000_000_000;

    struct Rig {
        pipeline: Arc<DecisionPipeline>,
        state_repo: Arc<MockStateRepository>,
        reward_repo: Arc<MockRewardRepo>,
        trace_repo: Arc<MockTraceRepo>,
        metrics: Arc<MetricsCollector>,
        clock: Arc<ManualClock>,
        shutdown_tx: watch::Sender<bool>,
        recorder_task: tokio::task::JoinHandle<()>,
    }

    impl Rig {
        async fn close(self) -> Arc<MockTraceRepo> {
            let _ = self.shutdown_tx.send(true);
            let _ = self.recorder_task.await;
            self.trace_repo
        }
    }

    fn rig() -> Rig {
        rig_with(Arc::new(MockStateRepository::default()))
    }

    fn rig_with(state_repo: Arc<MockStateRepository>) -> Rig {
        let clock = Arc::new(ManualClock::at(T0));
        let metrics = Arc::new(MetricsCollector::new(1_000));
        let reward_repo = Arc::new(MockRewardRepo::default());
        let trace_repo = Arc::new(MockTraceRepo::default());

        let states = Arc::new(StateStore::new(state_repo.clone(), clock.clone()));
        let features = Arc::new(MemFeatureRepo::default());
        let selector = Arc::new(LinearBandit::new(10, 42));
        let rewards = Arc::new(RewardQueue::new(
            reward_repo.clone(),
            clock.clone(),
            60_000,
            600_000,
        ));

        let (handle, recorder) = TraceRecorder::channel(
            trace_repo.clone(),
            metrics.clone(),
            RecorderConfig::default(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let recorder_task = tokio::spawn(recorder.run(shutdown_rx));

        let pipeline = Arc::new(DecisionPipeline::new(
            states,
            features,
            selector,
            rewards,
            handle,
            metrics.clone(),
            clock.clone(),
            PhaseThresholds::default(),
            600_000,
        ));

        Rig {
            pipeline,
            state_repo,
            reward_repo,
            trace_repo,
            metrics,
            clock,
            shutdown_tx,
            recorder_task,
        }
    }

    fn mk_event(word: &str, correct: bool, rt: u64, ts: u64) -> RawEvent {
        RawEvent {
            word_id: word.into(),
            is_correct: correct,
            response_time_ms: rt,
            dwell_time_ms: 2_000,
            pause_count: 0,
            switch_count: 0,
            retry_count: 0,
            focus_loss_ms: 0,
            interaction_density: 1.0,
            timestamp_ms: ts,
        }
    }

    #[tokio::test]
    async fn happy_path_decision_for_a_new_user() {
        let r = rig();

        let result = r
            .pipeline
            .process_event("u1", mk_event("w1", true, 2_500, T0), Some("s1".into()))
            .await
            .unwrap();

        // state initialized from defaults, then updated once
        assert_eq!(result.state.interaction_count, 1);
        assert!(result.state.motivation > 0.6);
        assert!(result.reward > 0.0 && result.reward <= 1.0);
        assert!(!result.should_break);
        assert_eq!(result.phase, ColdStartPhase::Classify);
        assert!(result.feature_vector.is_some());

        // exactly one PENDING delayed-reward task, due at least 60s out
        let tasks = r.reward_repo.rows.lock();
        assert_eq!(tasks.len(), 1);
        let task = tasks.values().next().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.due_ms >= T0 + 60_000);
        drop(tasks);

        // exactly one successfully ingested trace with the named stages
        let trace_repo = r.close().await;
        let traces = trace_repo.rows.lock();
        assert_eq!(traces.len(), 1);
        let trace = traces.values().next().unwrap();
        assert_eq!(trace.ingestion_status, IngestionStatus::Success);
        let stage_names: Vec<&str> = trace.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(
            stage_names,
            vec![
                "load_state",
                "derive_stats",
                "update_state",
                "extract_features",
                "select_strategy",
                "realtime_update",
                "persist"
            ]
        );
    }

    #[tokio::test]
    async fn invalid_events_are_rejected_without_side_effects() {
        let r = rig();

        let mut event = mk_event("w1", true, 2_500, T0);
        event.response_time_ms = 0;
        let err = r
            .pipeline
            .process_event("u1", event, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");

        let stale = mk_event("w1", true, 2_500, T0 - 25 * 3_600_000);
        assert!(r.pipeline.process_event("u1", stale, None).await.is_err());

        assert!(r.state_repo.states.lock().is_empty());
        assert!(r.reward_repo.rows.lock().is_empty());
    }

    #[tokio::test]
    async fn concurrent_events_for_one_user_never_lose_updates() {
        let r = rig();

        let mut set = tokio::task::JoinSet::new();
        for i in 0..10u64 {
            let p = r.pipeline.clone();
            set.spawn(async move {
                p.process_event("u1", mk_event("w1", true, 2_500, T0 + i), None)
                    .await
            });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap().unwrap();
        }

        let state = r.state_repo.states.lock().get("u1").cloned().unwrap();
        assert_eq!(state.interaction_count, 10);
    }

    #[tokio::test]
    async fn different_users_do_not_serialize_against_each_other() {
        let r = rig();

        let mut set = tokio::task::JoinSet::new();
        for u in 0..8 {
            let p = r.pipeline.clone();
            set.spawn(async move {
                p.process_event(&format!("u{u}"), mk_event("w1", true, 2_500, T0), None)
                    .await
            });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap().unwrap();
        }

        assert_eq!(r.state_repo.states.lock().len(), 8);
    }

    #[tokio::test]
    async fn persistence_failure_aborts_the_event() {
        let r = rig();
        *r.state_repo.fail_persist.lock() = true;

        let err = r
            .pipeline
            .process_event("u1", mk_event("w1", true, 2_500, T0), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DEPENDENCY");
        assert!(r.state_repo.states.lock().is_empty());
        assert_eq!(
            r.metrics.error.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn reward_enqueue_failure_does_not_sink_the_decision() {
        // a queue repo that always fails
        struct FailingRewardRepo;
        #[async_trait]
        impl RewardQueueRepository for FailingRewardRepo {
            async fn insert_or_fetch(
                &self,
                _t: &crate::rewards::model::DelayedRewardTask,
            ) -> anyhow::Result<crate::rewards::model::DelayedRewardTask> {
                Err(anyhow::anyhow!("queue store offline"))
            }
            async fn claim_due(
                &self,
                _now: u64,
                _limit: usize,
            ) -> anyhow::Result<Vec<crate::rewards::model::DelayedRewardTask>> {
                Ok(vec![])
            }
            async fn mark_done(&self, _id: &str) -> anyhow::Result<()> {
                Ok(())
            }
            async fn release_for_retry(
                &self,
                _id: &str,
                _e: &str,
                _n: u64,
            ) -> anyhow::Result<()> {
                Ok(())
            }
            async fn mark_failed(&self, _id: &str, _e: &str) -> anyhow::Result<()> {
                Ok(())
            }
            async fn fetch_by_key(
                &self,
                _k: &str,
            ) -> anyhow::Result<Option<crate::rewards::model::DelayedRewardTask>> {
                Ok(None)
            }
        }

        let clock = Arc::new(ManualClock::at(T0));
        let metrics = Arc::new(MetricsCollector::new(100));
        let state_repo = Arc::new(MockStateRepository::default());
        let trace_repo = Arc::new(MockTraceRepo::default());
        let (handle, _recorder) = TraceRecorder::channel(
            trace_repo,
            metrics.clone(),
            RecorderConfig::default(),
        );

        let pipeline = DecisionPipeline::new(
            Arc::new(StateStore::new(state_repo.clone(), clock.clone())),
            Arc::new(MemFeatureRepo::default()),
            Arc::new(LinearBandit::new(10, 42)),
            Arc::new(RewardQueue::new(
                Arc::new(FailingRewardRepo),
                clock.clone(),
                60_000,
                600_000,
            )),
            handle,
            metrics,
            clock,
            PhaseThresholds::default(),
            600_000,
        );

        let result = pipeline
            .process_event("u1", mk_event("w1", true, 2_500, T0), None)
            .await
            .unwrap();
        assert!(result.reward.is_finite());
        assert_eq!(state_repo.states.lock().len(), 1);
    }

    #[tokio::test]
    async fn deadline_miss_returns_timeout_and_persists_nothing() {
        struct SlowRepo(MockStateRepository);
        #[async_trait]
        impl StateRepository for SlowRepo {
            async fn fetch_state(
                &self,
                _user_id: &str,
            ) -> anyhow::Result<Option<crate::state::model::UserState>> {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(None)
            }
            async fn fetch_daily(
                &self,
                u: &str,
                d: chrono::NaiveDate,
            ) -> anyhow::Result<Option<crate::state::model::StateSnapshot>> {
                self.0.fetch_daily(u, d).await
            }
            async fn recent_answers(
                &self,
                u: &str,
                l: u32,
            ) -> anyhow::Result<Vec<AnswerRecord>> {
                self.0.recent_answers(u, l).await
            }
            async fn fetch_word_state(
                &self,
                u: &str,
                w: &str,
            ) -> anyhow::Result<Option<WordState>> {
                self.0.fetch_word_state(u, w).await
            }
            async fn persist_event(
                &self,
                s: &crate::state::model::UserState,
                r: &crate::state::model::StateSnapshot,
                a: &AnswerRecord,
                w: &WordState,
            ) -> anyhow::Result<()> {
                self.0.persist_event(s, r, a, w).await
            }
            async fn delete_user(&self, u: &str) -> anyhow::Result<()> {
                self.0.delete_user(u).await
            }
        }

        let clock = Arc::new(ManualClock::at(T0));
        let metrics = Arc::new(MetricsCollector::new(100));
        let reward_repo = Arc::new(MockRewardRepo::default());
        let trace_repo = Arc::new(MockTraceRepo::default());
        let (handle, _recorder) = TraceRecorder::channel(
            trace_repo,
            metrics.clone(),
            RecorderConfig::default(),
        );

        let pipeline = DecisionPipeline::new(
            Arc::new(StateStore::new(
                Arc::new(SlowRepo(MockStateRepository::default())),
                clock.clone(),
            )),
            Arc::new(MemFeatureRepo::default()),
            Arc::new(LinearBandit::new(10, 42)),
            Arc::new(RewardQueue::new(
                reward_repo.clone(),
                clock.clone(),
                60_000,
                600_000,
            )),
            handle,
            metrics.clone(),
            clock,
            PhaseThresholds::default(),
            600_000,
        );

        tokio::time::pause();
        let err = pipeline
            .process_event_with_deadline(
                "u1",
                mk_event("w1", true, 2_500, T0),
                None,
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(
            metrics.timeout.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert!(reward_repo.rows.lock().is_empty());
    }

    #[tokio::test]
    async fn phase_transitions_follow_the_interaction_count() {
        let r = rig();

        for i in 0..15u64 {
            r.pipeline
                .process_event("u1", mk_event("w1", true, 2_500, T0 + i), None)
                .await
                .unwrap();
        }
        assert_eq!(
            r.pipeline.get_phase("u1").await.unwrap(),
            ColdStartPhase::Explore
        );

        for i in 15..30u64 {
            r.pipeline
                .process_event("u1", mk_event("w1", true, 2_500, T0 + i), None)
                .await
                .unwrap();
        }
        assert_eq!(
            r.pipeline.get_phase("u1").await.unwrap(),
            ColdStartPhase::Normal
        );
    }

    #[tokio::test]
    async fn should_break_trips_on_high_fatigue() {
        let r = rig();
        {
            let mut state = UserState::initial("u1", T0);
            state.fatigue = 0.85;
            r.state_repo.states.lock().insert("u1".into(), state);
        }

        let result = r
            .pipeline
            .process_event("u1", mk_event("w1", true, 2_500, T0), None)
            .await
            .unwrap();
        assert!(result.should_break);
    }

    #[tokio::test]
    async fn should_break_trips_on_low_recent_accuracy() {
        let r = rig();

        // 20 wrong answers on record
        for i in 0..20u64 {
            r.state_repo.answers.lock().push(AnswerRecord {
                id: new_id(),
                user_id: "u1".into(),
                word_id: "w1".into(),
                is_correct: false,
                response_time_ms: 9_000,
                timestamp_ms: T0 - 1_000 + i,
            });
        }

        let result = r
            .pipeline
            .process_event("u1", mk_event("w1", true, 2_500, T0), None)
            .await
            .unwrap();
        assert!(result.should_break);
    }

    #[tokio::test]
    async fn get_strategy_serves_the_cached_decision() {
        let r = rig();

        let result = r
            .pipeline
            .process_event("u1", mk_event("w1", true, 2_500, T0), None)
            .await
            .unwrap();

        let cached = r.pipeline.get_strategy("u1").await.unwrap();
        assert_eq!(cached, result.strategy);

        // past the TTL the cache no longer answers
        r.clock.advance(600_001);
        let fallback = r.pipeline.get_strategy("u1").await.unwrap();
        assert!(fallback.interval_scale > 0.0);
    }

    #[tokio::test]
    async fn reset_user_clears_state_and_cache() {
        let r = rig();

        r.pipeline
            .process_event("u1", mk_event("w1", true, 2_500, T0), None)
            .await
            .unwrap();
        r.pipeline.reset_user("u1").await.unwrap();

        assert!(r.state_repo.states.lock().is_empty());
        let state = r.pipeline.get_state("u1").await.unwrap();
        assert_eq!(state.interaction_count, 0);
    }

    #[tokio::test]
    async fn batch_process_skips_bad_events() {
        let r = rig();

        let mut bad = mk_event("w2", true, 2_500, T0);
        bad.response_time_ms = 0;

        let (count, last) = r
            .pipeline
            .batch_process(
                "u1",
                vec![
                    mk_event("w1", true, 2_500, T0),
                    bad,
                    mk_event("w3", false, 6_000, T0 + 2),
                ],
                None,
            )
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(last.unwrap().state.interaction_count, 2);
    }

    #[tokio::test]
    async fn manual_reward_corrections_respect_the_delay_floor() {
        let r = rig();

        let task = r
            .pipeline
            .apply_delayed_reward("u1", Some("s1".into()), 0.7, "manual:u1:1".into())
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.due_ms >= T0 + 60_000);

        // same key: same task back
        let again = r
            .pipeline
            .apply_delayed_reward("u1", Some("s1".into()), -0.2, "manual:u1:1".into())
            .await
            .unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(r.reward_repo.rows.lock().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_event_replay_keeps_one_reward_task() {
        let r = rig();

        for _ in 0..3 {
            r.pipeline
                .process_event("u1", mk_event("w1", true, 2_500, T0), Some("s1".into()))
                .await
                .unwrap();
        }

        // same (user, word, event-ts) key: one task row
        assert_eq!(r.reward_repo.rows.lock().len(), 1);
    }
}
