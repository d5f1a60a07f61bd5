use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use crate::amas::offline::OfflineLoop;
use crate::amas::online::OnlineLoop;

const CLEANUP_SCHEDULE: &str = "0 */10 * * * *";

/// Admits work while open and lets `close` wait for admitted work to finish.
///
/// Offline cycles drain matured buckets before applying them, so a cycle that
/// is dropped halfway loses the rewards it already took.
#[derive(Clone)]
pub struct CycleGate {
    open: Arc<AtomicBool>,
    in_flight: Arc<RwLock<()>>,
}

impl CycleGate {
    pub fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
            in_flight: Arc::new(RwLock::new(())),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Runs `work` to completion unless the gate is already closed.
    pub async fn run<F: Future>(&self, work: F) -> Option<F::Output> {
        let _admitted = self.in_flight.read().await;
        if !self.is_open() {
            return None;
        }
        Some(work.await)
    }

    /// Refuses new work and waits for every admitted run to return.
    pub async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _drained = self.in_flight.write().await;
    }
}

impl Default for CycleGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the offline reward cycle and idle-session cleanup on cron schedules.
pub struct WorkerManager {
    scheduler: Mutex<JobScheduler>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    cycle_gate: CycleGate,
    offline: Arc<OfflineLoop>,
    online: Arc<OnlineLoop>,
    cycle_schedule: String,
    inactive_ttl_ms: i64,
}

impl WorkerManager {
    pub async fn new(
        offline: Arc<OfflineLoop>,
        online: Arc<OnlineLoop>,
        cycle_schedule: impl Into<String>,
        inactive_ttl_ms: i64,
    ) -> Result<Self, WorkerError> {
        let scheduler = JobScheduler::new().await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            shutdown_tx,
            running: AtomicBool::new(false),
            cycle_gate: CycleGate::new(),
            offline,
            online,
            cycle_schedule: cycle_schedule.into(),
            inactive_ttl_ms,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub async fn start(&self) -> Result<(), WorkerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let enable_offline = std::env::var("ENABLE_OFFLINE_WORKER")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let scheduler = self.scheduler.lock().await;

        if enable_offline {
            let offline = Arc::clone(&self.offline);
            let gate = self.cycle_gate.clone();
            let job = Job::new_async(self.cycle_schedule.as_str(), move |_uuid, _lock| {
                let offline = Arc::clone(&offline);
                let gate = gate.clone();
                Box::pin(async move {
                    if gate.run(offline.run_cycle()).await.is_none() {
                        debug!("Offline cycle skipped, workers stopping");
                    }
                })
            })?;
            scheduler.add(job).await?;
            info!(schedule = %self.cycle_schedule, "Offline reward worker scheduled");
        }

        {
            let online = Arc::clone(&self.online);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let max_idle_ms = self.inactive_ttl_ms;
            let job = Job::new_async(CLEANUP_SCHEDULE, move |_uuid, _lock| {
                let online = Arc::clone(&online);
                let mut rx = shutdown_rx.resubscribe();
                Box::pin(async move {
                    tokio::select! {
                        _ = rx.recv() => {},
                        _ = async {
                            let cleaned = online.cleanup_inactive(max_idle_ms);
                            if cleaned > 0 {
                                info!(
                                    cleaned = cleaned,
                                    sessions = online.session_count(),
                                    "Idle session cleanup"
                                );
                            }
                        } => {}
                    }
                })
            })?;
            scheduler.add(job).await?;
            info!("Idle session cleanup scheduled (every 10 minutes)");
        }

        scheduler.start().await?;
        info!("Workers started");
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping workers...");
        let _ = self.shutdown_tx.send(());
        self.cycle_gate.close().await;

        let mut scheduler = self.scheduler.lock().await;
        if let Err(e) = scheduler.shutdown().await {
            warn!(error = %e, "Error shutting down scheduler");
        }
        info!("Workers stopped");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    use crate::amas::config::DelayedRewardConfig;
    use crate::amas::decision::DecisionPolicy;
    use crate::amas::delayed_reward::{DelayedRewardAggregator, RewardScheduleEntry};
    use crate::amas::metrics::AmasMetrics;
    use crate::amas::offline::{ApplyError, RewardApplier};

    #[derive(Default)]
    struct SlowApplier {
        applied: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl RewardApplier for SlowApplier {
        async fn apply_reward(
            &self,
            user_id: &str,
            _reward: f64,
            _feature_vector: Option<&[f64]>,
            _action_index: Option<usize>,
        ) -> Result<(), ApplyError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.applied.lock().push(user_id.to_string());
            Ok(())
        }
    }

    fn offline(applier: Arc<SlowApplier>) -> Arc<OfflineLoop> {
        let config = DelayedRewardConfig {
            schedule: vec![RewardScheduleEntry::new(0, 1.0, "immediate")],
            ..DelayedRewardConfig::default()
        };
        let aggregator = Arc::new(DelayedRewardAggregator::new(config.schedule.clone()).unwrap());
        Arc::new(OfflineLoop::new(
            aggregator,
            applier,
            Arc::new(DecisionPolicy::default()),
            config,
            Arc::new(AmasMetrics::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn closing_mid_cycle_waits_for_the_cycle() {
        let applier = Arc::new(SlowApplier::default());
        let offline = offline(applier.clone());
        for user in ["a", "b", "c"] {
            offline.aggregator().add_reward(user, 0.5, None, 0).unwrap();
        }

        let gate = CycleGate::new();
        let cycle = {
            let gate = gate.clone();
            let offline = Arc::clone(&offline);
            tokio::spawn(async move { gate.run(offline.process_once(0)).await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(applier.applied.lock().len(), 1);
        gate.close().await;

        assert_eq!(applier.applied.lock().len(), 3);
        assert_eq!(offline.aggregator().pending_count(), 0);
        let report = cycle.await.unwrap().unwrap();
        assert_eq!(report.applied, 3);
    }

    #[tokio::test]
    async fn closed_gate_skips_new_cycles() {
        let applier = Arc::new(SlowApplier::default());
        let offline = offline(applier.clone());
        offline.aggregator().add_reward("a", 0.5, None, 0).unwrap();

        let gate = CycleGate::new();
        gate.close().await;

        assert!(gate.run(offline.process_once(0)).await.is_none());
        assert_eq!(offline.aggregator().pending_count(), 1);
        assert!(applier.applied.lock().is_empty());
    }
}
