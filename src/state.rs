use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::amas::config::{AMASConfig, ConfigError};
use crate::amas::decision::DecisionPolicy;
use crate::amas::delayed_reward::{AggregatorSnapshot, DelayedRewardAggregator, ScheduleError};
use crate::amas::metrics::AmasMetrics;
use crate::amas::offline::{OfflineLoop, PolicyRewardApplier};
use crate::amas::online::{OnlineLoop, OnlineResult, ProcessContext};
use crate::amas::optimizer::{BayesianOptimizer, OptimizerError, OptimizerState};
use crate::amas::persistence::{
    AmasRepository, CachedRepository, RepositoryError, UserStateProvider,
};
use crate::amas::types::{RawEvent, UserState};
use crate::cache::{CacheClient, RedisCache};
use crate::config::Config;
use crate::core::EventBus;
use crate::db::memory::{MemoryDecisionStore, MemoryRepository};
use crate::db::operations::{PgAmasRepository, PgDecisionStore};
use crate::db::{DatabaseProxy, DbInitError};
use crate::services::decision_recorder::{DecisionEventSink, DecisionRecorder, DecisionStore};
use crate::workers::{WorkerError, WorkerManager};

const AGGREGATOR_SNAPSHOT: &str = "delayed_reward_aggregator";
const OPTIMIZER_SNAPSHOT: &str = "bayesian_optimizer";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
    #[error(transparent)]
    Database(#[from] DbInitError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Every AMAS service, wired from one config and a set of backends.
pub struct AmasRuntime {
    config: Arc<AMASConfig>,
    metrics: Arc<AmasMetrics>,
    policy: Arc<DecisionPolicy>,
    aggregator: Arc<DelayedRewardAggregator>,
    repository: Arc<dyn AmasRepository>,
    cached: Option<Arc<CachedRepository>>,
    recorder: DecisionRecorder,
    events: Arc<EventBus>,
    online: Arc<OnlineLoop>,
    offline: Arc<OfflineLoop>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl AmasRuntime {
    pub fn new<R>(
        config: AMASConfig,
        repository: Arc<R>,
        store: Arc<dyn DecisionStore>,
        cache: Option<Arc<dyn CacheClient>>,
    ) -> Result<Self, RuntimeError>
    where
        R: AmasRepository + UserStateProvider + 'static,
    {
        config.validate()?;
        let config = Arc::new(config);
        let metrics = Arc::new(AmasMetrics::new());
        let policy = Arc::new(DecisionPolicy::new(config.bandit.clone()));
        let aggregator = Arc::new(DelayedRewardAggregator::new(
            config.delayed_reward.schedule.clone(),
        )?);
        let events = Arc::new(EventBus::new());

        let mut cached = None;
        let (repository, state_provider): (Arc<dyn AmasRepository>, Arc<dyn UserStateProvider>) =
            match cache {
                Some(cache) => {
                    let wrapped = Arc::new(CachedRepository::new(
                        repository,
                        cache,
                        config.cache.clone(),
                        Arc::clone(&metrics),
                    ));
                    cached = Some(Arc::clone(&wrapped));
                    let as_repository: Arc<dyn AmasRepository> = wrapped.clone();
                    let as_provider: Arc<dyn UserStateProvider> = wrapped;
                    (as_repository, as_provider)
                }
                None => {
                    let as_repository: Arc<dyn AmasRepository> = repository.clone();
                    let as_provider: Arc<dyn UserStateProvider> = repository;
                    (as_repository, as_provider)
                }
            };

        let sink: Arc<dyn DecisionEventSink> = events.clone();
        let recorder = DecisionRecorder::new(
            store,
            Some(sink),
            config.recorder.clone(),
            Arc::clone(&metrics),
        );

        let online = OnlineLoop::new(Arc::clone(&config), Arc::clone(&policy), Arc::clone(&metrics))
            .with_repository(Arc::clone(&repository))
            .with_recorder(recorder.clone())
            .with_aggregator(Arc::clone(&aggregator));

        let applier = Arc::new(PolicyRewardApplier::new(
            Arc::clone(&policy),
            Some(Arc::clone(&repository)),
        ));
        let mut offline = OfflineLoop::new(
            Arc::clone(&aggregator),
            applier,
            Arc::clone(&policy),
            config.delayed_reward.clone(),
            Arc::clone(&metrics),
        )
        .with_state_provider(state_provider)
        .with_event_bus(Arc::clone(&events));

        if config.optimizer.enabled {
            let optimizer = BayesianOptimizer::new(config.optimizer.clone())?;
            offline = offline.with_optimizer(optimizer, config.optimizer.min_rewards_per_evaluation);
        }

        Ok(Self {
            config,
            metrics,
            policy,
            aggregator,
            repository,
            cached,
            recorder,
            events,
            online: Arc::new(online),
            offline: Arc::new(offline),
            flush_task: Mutex::new(None),
        })
    }

    /// Runtime without external services.
    pub fn in_memory(config: AMASConfig) -> Result<Self, RuntimeError> {
        Self::new(
            config,
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryDecisionStore::new()),
            None,
        )
    }

    /// Postgres-backed runtime, with Redis in front when `REDIS_URL` is set
    /// and reachable.
    pub async fn connect(host: &Config, config: AMASConfig) -> Result<Self, RuntimeError> {
        let url = host.database_url.as_deref().ok_or(DbInitError::MissingUrl)?;
        let proxy = DatabaseProxy::connect(url, host.db_max_connections).await?;
        proxy.run_migrations().await?;

        let cache: Option<Arc<dyn CacheClient>> = match host.redis_url.as_deref() {
            Some(redis_url) => match RedisCache::connect(redis_url).await {
                Ok(cache) => {
                    if cache.is_connected().await {
                        info!("Redis cache connected");
                        let cache: Arc<dyn CacheClient> = Arc::new(cache);
                        Some(cache)
                    } else {
                        warn!("Redis did not answer PING, running without cache");
                        None
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, running without cache");
                    None
                }
            },
            None => None,
        };

        let runtime = Self::new(
            config,
            Arc::new(PgAmasRepository::new(Arc::clone(&proxy))),
            Arc::new(PgDecisionStore::new(proxy)),
            cache,
        )?;
        runtime.restore_snapshots().await?;
        Ok(runtime)
    }

    /// Reloads pending rewards and optimizer history saved by the previous
    /// process. Snapshots that no longer validate are logged and skipped.
    pub async fn restore_snapshots(&self) -> Result<(), RuntimeError> {
        if let Some(payload) = self.repository.load_snapshot(AGGREGATOR_SNAPSHOT).await? {
            match serde_json::from_value::<AggregatorSnapshot>(payload) {
                Ok(snapshot) => {
                    let pending = snapshot.pending.len();
                    match self.aggregator.set_state(snapshot) {
                        Ok(()) => info!(pending = pending, "Restored pending delayed rewards"),
                        Err(e) => warn!(error = %e, "Ignoring delayed reward snapshot"),
                    }
                }
                Err(e) => warn!(error = %e, "Unreadable delayed reward snapshot"),
            }
        }

        if self.offline.optimizer_state().is_some() {
            if let Some(payload) = self.repository.load_snapshot(OPTIMIZER_SNAPSHOT).await? {
                match serde_json::from_value::<OptimizerState>(payload) {
                    Ok(state) => {
                        let evaluations = state.observations.len();
                        match self.offline.restore_optimizer(state) {
                            Ok(()) => info!(evaluations = evaluations, "Restored optimizer history"),
                            Err(e) => warn!(error = %e, "Ignoring optimizer snapshot"),
                        }
                    }
                    Err(e) => warn!(error = %e, "Unreadable optimizer snapshot"),
                }
            }
        }
        Ok(())
    }

    /// Saves pending rewards and optimizer history for the next process.
    pub async fn persist_snapshots(&self) -> Result<(), RuntimeError> {
        let pending = serde_json::to_value(self.aggregator.get_state()).map_err(RepositoryError::from)?;
        self.repository.save_snapshot(AGGREGATOR_SNAPSHOT, &pending).await?;

        if let Some(state) = self.offline.optimizer_state() {
            let history = serde_json::to_value(state).map_err(RepositoryError::from)?;
            self.repository.save_snapshot(OPTIMIZER_SNAPSHOT, &history).await?;
        }
        Ok(())
    }

    /// Starts the periodic recorder flush.
    pub fn start(&self) {
        let mut task = self.flush_task.lock();
        if task.is_none() {
            *task = Some(self.recorder.spawn_periodic_flush());
            info!("AMAS runtime started");
        }
    }

    pub async fn workers(&self) -> Result<WorkerManager, RuntimeError> {
        Ok(WorkerManager::new(
            Arc::clone(&self.offline),
            Arc::clone(&self.online),
            self.config.delayed_reward.cycle_schedule.clone(),
            self.config.online.inactive_ttl_ms,
        )
        .await?)
    }

    pub async fn shutdown(&self) {
        self.recorder.shutdown().await;
        let task = self.flush_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Recorder flush task ended abnormally");
            }
        }
        if let Err(e) = self.persist_snapshots().await {
            warn!(error = %e, "Failed to persist AMAS snapshots");
        }
        info!(metrics = ?self.metrics.snapshot(), "AMAS runtime stopped");
    }

    pub async fn process_event(
        &self,
        user_id: &str,
        event: RawEvent,
        current_state: Option<UserState>,
        ctx: ProcessContext,
    ) -> OnlineResult {
        self.online.process(user_id, event, current_state, ctx).await
    }

    pub async fn invalidate_user(&self, user_id: &str) {
        if let Some(cached) = &self.cached {
            cached.invalidate_cache(user_id).await;
        }
    }

    pub fn config(&self) -> &Arc<AMASConfig> {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<AmasMetrics> {
        &self.metrics
    }

    pub fn policy(&self) -> &Arc<DecisionPolicy> {
        &self.policy
    }

    pub fn aggregator(&self) -> &Arc<DelayedRewardAggregator> {
        &self.aggregator
    }

    pub fn repository(&self) -> &Arc<dyn AmasRepository> {
        &self.repository
    }

    pub fn recorder(&self) -> &DecisionRecorder {
        &self.recorder
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn online(&self) -> &Arc<OnlineLoop> {
        &self.online
    }

    pub fn offline(&self) -> &Arc<OfflineLoop> {
        &self.offline
    }
}
