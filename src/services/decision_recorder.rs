use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::amas::config::RecorderConfig;
use crate::amas::metrics::AmasMetrics;
use crate::amas::types::{Action, DecisionSource, DecisionTrace};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionInsight {
    pub decision_id: String,
    pub user_id: Option<String>,
    pub feature_hash: String,
    pub state_snapshot: serde_json::Value,
    pub selected_action: Action,
    pub confidence: f64,
    pub reward: Option<f64>,
    pub created_at: i64,
}

#[async_trait]
pub trait DecisionStore: Send + Sync {
    /// Persists the batch atomically. Re-persisting a decision id replaces
    /// the record and its pipeline stages.
    async fn persist_batch(&self, traces: &[DecisionTrace]) -> Result<(), StoreError>;

    /// Writes or updates the record with a FAILED status and the error.
    async fn mark_failed(&self, trace: &DecisionTrace, error: &str) -> Result<(), StoreError>;

    async fn write_insights(&self, insights: &[DecisionInsight]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionEvent {
    pub decision_id: String,
    pub user_id: Option<String>,
    pub action: Action,
    pub confidence: f64,
    pub source: DecisionSource,
    pub reward: Option<f64>,
    pub timestamp: i64,
}

impl From<&DecisionTrace> for DecisionEvent {
    fn from(trace: &DecisionTrace) -> Self {
        Self {
            decision_id: trace.decision_id.clone(),
            user_id: trace.user_id.clone(),
            action: trace.selected_action.clone(),
            confidence: trace.confidence,
            source: trace.decision_source,
            reward: trace.reward,
            timestamp: trace.timestamp,
        }
    }
}

/// Receives decisions after they are persisted. Must not block.
pub trait DecisionEventSink: Send + Sync {
    fn emit_decision(&self, event: DecisionEvent);
}

pub fn feature_hash(values: &[f64]) -> String {
    let mut hasher = Sha256::new();
    for v in values {
        hasher.update(v.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

fn insight_for(trace: &DecisionTrace) -> Option<DecisionInsight> {
    let features = trace.feature_vector.as_ref()?;
    Some(DecisionInsight {
        decision_id: trace.decision_id.clone(),
        user_id: trace.user_id.clone(),
        feature_hash: feature_hash(features),
        state_snapshot: trace.state_snapshot.clone(),
        selected_action: trace.selected_action.clone(),
        confidence: trace.confidence,
        reward: trace.reward,
        created_at: trace.timestamp,
    })
}

struct QueuedTrace {
    trace: DecisionTrace,
    has_permit: bool,
}

struct RecorderInner {
    store: Arc<dyn DecisionStore>,
    sink: Option<Arc<dyn DecisionEventSink>>,
    config: RecorderConfig,
    metrics: Arc<AmasMetrics>,
    queue: Mutex<VecDeque<QueuedTrace>>,
    capacity: Semaphore,
    flushing: AtomicBool,
    idle: Notify,
    shutdown_tx: broadcast::Sender<()>,
}

/// Asynchronous, batched writer for decision traces.
///
/// `record` never fails: a full queue makes it wait up to the backpressure
/// timeout, after which the trace is queued over capacity.
#[derive(Clone)]
pub struct DecisionRecorder {
    inner: Arc<RecorderInner>,
}

impl DecisionRecorder {
    pub fn new(
        store: Arc<dyn DecisionStore>,
        sink: Option<Arc<dyn DecisionEventSink>>,
        config: RecorderConfig,
        metrics: Arc<AmasMetrics>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(RecorderInner {
                store,
                sink,
                capacity: Semaphore::new(config.queue_capacity),
                config,
                metrics,
                queue: Mutex::new(VecDeque::new()),
                flushing: AtomicBool::new(false),
                idle: Notify::new(),
                shutdown_tx,
            }),
        }
    }

    pub async fn record(&self, trace: DecisionTrace) {
        let inner = &self.inner;
        let has_permit = match inner.capacity.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => {
                AmasMetrics::incr(&inner.metrics.backpressure_waits);
                self.trigger_flush();
                let timeout = Duration::from_millis(inner.config.backpressure_timeout_ms);
                match tokio::time::timeout(timeout, inner.capacity.acquire()).await {
                    Ok(Ok(permit)) => {
                        permit.forget();
                        true
                    }
                    _ => {
                        AmasMetrics::incr(&inner.metrics.backpressure_timeouts);
                        warn!(
                            decision_id = %trace.decision_id,
                            timeout_ms = inner.config.backpressure_timeout_ms,
                            "Decision queue still full after backpressure timeout, enqueueing anyway"
                        );
                        false
                    }
                }
            }
        };

        inner.queue.lock().push_back(QueuedTrace { trace, has_permit });
        AmasMetrics::incr(&inner.metrics.recorder_enqueued);
        self.trigger_flush();
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::SeqCst)
    }

    /// Starts a background flush unless one is already running.
    pub fn trigger_flush(&self) {
        if !self.inner.try_claim() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_flush().await;
        });
    }

    /// Waits for any running flush, then drains the queue.
    pub async fn flush_now(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.try_claim() {
                self.inner.run_flush().await;
                return;
            }
            notified.await;
        }
    }

    pub fn spawn_periodic_flush(&self) -> JoinHandle<()> {
        let recorder = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let period = Duration::from_millis(self.inner.config.flush_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if recorder.queue_len() > 0 {
                            recorder.trigger_flush();
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Decision recorder flush timer stopped");
                        break;
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
        self.flush_now().await;
        info!(
            remaining = self.queue_len(),
            "Decision recorder shut down"
        );
    }
}

impl RecorderInner {
    fn try_claim(&self) -> bool {
        self.flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn take_batch(&self) -> Vec<QueuedTrace> {
        let mut queue = self.queue.lock();
        let n = queue.len().min(self.config.max_batch_size.max(1));
        queue.drain(..n).collect()
    }

    /// Caller must hold the flushing flag.
    async fn run_flush(&self) {
        loop {
            loop {
                let batch = self.take_batch();
                if batch.is_empty() {
                    break;
                }
                self.flush_batch(batch).await;
            }
            self.flushing.store(false, Ordering::SeqCst);
            self.idle.notify_waiters();

            // Records that arrived after the last drain but before the flag
            // was released would otherwise wait for the timer.
            if self.queue.lock().is_empty() || !self.try_claim() {
                break;
            }
        }
    }

    async fn flush_batch(&self, batch: Vec<QueuedTrace>) {
        let permits = batch.iter().filter(|q| q.has_permit).count();
        let traces: Vec<DecisionTrace> = batch.into_iter().map(|q| q.trace).collect();

        match self.persist_with_retry(&traces).await {
            Ok(()) => {
                AmasMetrics::add(&self.metrics.recorder_persisted, traces.len() as u64);
                debug!(count = traces.len(), "Decision batch persisted");
                self.after_persist(&traces);
            }
            Err(e) => {
                AmasMetrics::add(&self.metrics.recorder_failed, traces.len() as u64);
                let message = e.to_string();
                error!(
                    count = traces.len(),
                    attempts = self.config.max_retries + 1,
                    error = %message,
                    "Decision batch failed after retries, marking as FAILED"
                );
                for trace in &traces {
                    if let Err(mark_err) = self.store.mark_failed(trace, &message).await {
                        error!(
                            decision_id = %trace.decision_id,
                            error = %mark_err,
                            "Failed to write FAILED marker"
                        );
                    }
                }
            }
        }

        self.capacity.add_permits(permits);
    }

    async fn persist_with_retry(&self, traces: &[DecisionTrace]) -> Result<(), StoreError> {
        let mut attempt: u32 = 0;
        loop {
            match self.store.persist_batch(traces).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.max_retries => {
                    let delay = self
                        .config
                        .retry_base_delay_ms
                        .saturating_mul(1u64 << attempt.min(16));
                    AmasMetrics::incr(&self.metrics.recorder_retries);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay,
                        error = %e,
                        "Decision batch persist failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn after_persist(&self, traces: &[DecisionTrace]) {
        let insights: Vec<DecisionInsight> = traces.iter().filter_map(insight_for).collect();
        if !insights.is_empty() {
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                if let Err(e) = store.write_insights(&insights).await {
                    warn!(count = insights.len(), error = %e, "Failed to write decision insights");
                }
            });
        }

        if let Some(sink) = &self.sink {
            for trace in traces {
                sink.emit_decision(DecisionEvent::from(trace));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_hash_is_stable_and_distinct() {
        let a = feature_hash(&[0.1, 0.2, 0.3]);
        assert_eq!(a, feature_hash(&[0.1, 0.2, 0.3]));
        assert_ne!(a, feature_hash(&[0.1, 0.2, 0.31]));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn insight_requires_features() {
        let mut trace = DecisionTrace::new("d1", Action::default(), 0);
        assert!(insight_for(&trace).is_none());
        trace.feature_vector = Some(vec![1.0, 2.0]);
        let insight = insight_for(&trace).unwrap();
        assert_eq!(insight.decision_id, "d1");
        assert_eq!(insight.feature_hash, feature_hash(&[1.0, 2.0]));
    }
}
