//! Bounded decision-trace recorder.
//!
//! Producers push into a bounded channel and wait at most the
//! backpressure timeout when it is full; on timeout the trace is dropped
//! and counted, never blocking the decision path further. A single flush
//! task drains the channel in bounded batches and persists each trace
//! with bounded retries, writing a FAILED ingestion marker when a trace
//! cannot be stored at all.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::monitoring::collector::MetricsCollector;
use crate::traces::model::DecisionTrace;
use crate::traces::repository::TraceRepository;

const PERSIST_MAX_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF_BASE_MS: u64 = 50;

#[derive(Clone, Copy, Debug)]
pub struct RecorderConfig {
    pub capacity: usize,
    pub backpressure_timeout_ms: u64,
    pub flush_interval_ms: u64,
    pub max_batch: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            backpressure_timeout_ms: 5_000,
            flush_interval_ms: 1_000,
            max_batch: 20,
        }
    }
}

/// Producer side; cheap to clone into the pipeline.
#[derive(Clone)]
pub struct TraceHandle {
    tx: mpsc::Sender<DecisionTrace>,
    backpressure_timeout: Duration,
    metrics: Arc<MetricsCollector>,
}

impl TraceHandle {
    /// Submits a trace, waiting at most the backpressure timeout when the
    /// queue is full. A timed-out or post-shutdown submission is dropped.
    pub async fn record(&self, trace: DecisionTrace) {
        let decision_id = trace.decision_id.clone();
        match tokio::time::timeout(self.backpressure_timeout, self.tx.send(trace)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                warn!(decision_id = %decision_id, "trace recorder stopped; trace dropped");
            }
            Err(_) => {
                self.metrics.record_backpressure_timeout();
                warn!(
                    decision_id = %decision_id,
                    "trace queue full past backpressure timeout; trace dropped"
                );
            }
        }
    }
}

pub struct TraceRecorder {
    repo: Arc<dyn TraceRepository>,
    rx: mpsc::Receiver<DecisionTrace>,
    cfg: RecorderConfig,
}

impl TraceRecorder {
    pub fn channel(
        repo: Arc<dyn TraceRepository>,
        metrics: Arc<MetricsCollector>,
        cfg: RecorderConfig,
    ) -> (TraceHandle, TraceRecorder) {
        let (tx, rx) = mpsc::channel(cfg.capacity.max(1));
        (
            TraceHandle {
                tx,
                backpressure_timeout: Duration::from_millis(cfg.backpressure_timeout_ms),
                metrics,
            },
            TraceRecorder { repo, rx, cfg },
        )
    }

    /// Flush loop: drains immediately on receipt and on the periodic tick;
    /// on shutdown performs a final drain so nothing queued is lost.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(component = "trace_recorder", event = "startup");
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.cfg.flush_interval_ms.max(1)));

        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(first) => {
                        let batch = self.gather(first);
                        self.flush(batch).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.drain_pending().await;
                }
                _ = shutdown.changed() => break,
            }
        }

        self.drain_pending().await;
        info!(component = "trace_recorder", event = "shutdown");
    }

    async fn drain_pending(&mut self) {
        while let Ok(first) = self.rx.try_recv() {
            let batch = self.gather(first);
            self.flush(batch).await;
        }
    }

    fn gather(&mut self, first: DecisionTrace) -> Vec<DecisionTrace> {
        let mut batch = vec![first];
        while batch.len() < self.cfg.max_batch {
            match self.rx.try_recv() {
                Ok(t) => batch.push(t),
                Err(_) => break,
            }
        }
        batch
    }

    async fn flush(&self, batch: Vec<DecisionTrace>) {
        debug!(count = batch.len(), "flushing trace batch");
        join_all(batch.into_iter().map(|t| self.persist_with_retry(t))).await;
    }

    async fn persist_with_retry(&self, trace: DecisionTrace) {
        let mut attempt: u32 = 0;
        loop {
            match self.repo.persist(&trace).await {
                Ok(()) => return,
                Err(e) if attempt + 1 < PERSIST_MAX_ATTEMPTS => {
                    attempt += 1;
                    warn!(
                        decision_id = %trace.decision_id,
                        attempt,
                        error = %e,
                        "trace persist failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(
                        PERSIST_BACKOFF_BASE_MS << attempt,
                    ))
                    .await;
                }
                Err(e) => {
                    error!(
                        decision_id = %trace.decision_id,
                        error = %e,
                        "trace persist exhausted retries; writing failure marker"
                    );
                    if let Err(e) = self
                        .repo
                        .persist_failure_marker(&trace.decision_id, trace.timestamp_ms)
                        .await
                    {
                        error!(
                            decision_id = %trace.decision_id,
                            error = %e,
                            "failure marker write failed; decision id lost"
                        );
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::traces::model::IngestionStatus;

    #[derive(Default)]
    pub struct MockTraceRepo {
        pub rows: Mutex<HashMap<String, DecisionTrace>>,
        pub markers: Mutex<Vec<String>>,
        pub persist_calls: AtomicU32,
        /// Number of leading persist calls that fail.
        pub fail_first: AtomicU32,
    }

    #[async_trait]
    impl TraceRepository for MockTraceRepo {
        async fn persist(&self, trace: &DecisionTrace) -> anyhow::Result<()> {
            self.persist_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(anyhow::anyhow!("trace store offline"));
            }
            self.rows
                .lock()
                .insert(trace.decision_id.clone(), trace.clone());
            Ok(())
        }

        async fn persist_failure_marker(
            &self,
            decision_id: &str,
            _timestamp_ms: u64,
        ) -> anyhow::Result<()> {
            self.markers.lock().push(decision_id.to_string());
            Ok(())
        }

        async fn fetch(&self, decision_id: &str) -> anyhow::Result<Option<DecisionTrace>> {
            Ok(self.rows.lock().get(decision_id).cloned())
        }
    }

    pub fn mk_trace(id: &str) -> DecisionTrace {
        DecisionTrace {
            decision_id: id.to_string(),
            answer_record_id: None,
            session_id: Some("s1".into()),
            timestamp_ms: 1_000,
            decision_source: "bandit".into(),
            weights_snapshot: None,
            selected_action: serde_json::json!({"difficulty": "mid"}),
            confidence: 0.6,
            reward: Some(0.4),
            stages: vec![],
            ingestion_status: IngestionStatus::Success,
        }
    }

    fn rig(cfg: RecorderConfig) -> (TraceHandle, TraceRecorder, Arc<MockTraceRepo>, Arc<MetricsCollector>) {
        let repo = Arc::new(MockTraceRepo::default());
        let metrics = Arc::new(MetricsCollector::new(100));
        let (handle, recorder) = TraceRecorder::channel(repo.clone(), metrics.clone(), cfg);
        (handle, recorder, repo, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn recorded_traces_are_persisted() {
        let (handle, recorder, repo, _) = rig(RecorderConfig::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(recorder.run(shutdown_rx));

        for i in 0..5 {
            handle.record(mk_trace(&format!("d{i}"))).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();

        assert_eq!(repo.rows.lock().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_persist_failures_are_retried() {
        let (handle, recorder, repo, _) = rig(RecorderConfig::default());
        repo.fail_first.store(2, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(recorder.run(shutdown_rx));

        handle.record(mk_trace("d1")).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();

        assert!(repo.rows.lock().contains_key("d1"));
        assert!(repo.markers.lock().is_empty());
        assert_eq!(repo.persist_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_write_a_failure_marker() {
        let (handle, recorder, repo, _) = rig(RecorderConfig::default());
        repo.fail_first.store(99, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(recorder.run(shutdown_rx));

        handle.record(mk_trace("d1")).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();

        assert!(repo.rows.lock().is_empty());
        assert_eq!(repo.markers.lock().as_slice(), ["d1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_after_backpressure_timeout() {
        // No recorder draining: the queue fills and stays full.
        let (handle, _recorder, _repo, metrics) = rig(RecorderConfig {
            capacity: 3,
            backpressure_timeout_ms: 100,
            flush_interval_ms: 1_000,
            max_batch: 20,
        });

        for i in 0..3 {
            handle.record(mk_trace(&format!("d{i}"))).await;
        }

        // queue is full: this submission must give up after ~100ms
        let start = tokio::time::Instant::now();
        handle.record(mk_trace("overflow")).await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_millis(1_000));

        assert_eq!(
            metrics
                .backpressure_timeout
                .load(std::sync::atomic::Ordering::Relaxed),
            1,
            "dropped traces and counter increments must match"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_the_remaining_queue() {
        let (handle, recorder, repo, _) = rig(RecorderConfig::default());

        // enqueue before the recorder ever runs
        for i in 0..7 {
            handle.record(mk_trace(&format!("d{i}"))).await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        recorder.run(shutdown_rx).await;

        assert_eq!(repo.rows.lock().len(), 7);
    }
}
