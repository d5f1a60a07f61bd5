use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::amas::config::CacheConfig;
use crate::amas::metrics::AmasMetrics;
use crate::amas::types::{BanditModel, PersistedBanditModel, UserState};
use crate::cache::keys::{amas_lock_key, amas_model_key, amas_state_key, amas_version_key};
use crate::cache::{apply_ttl_jitter, CacheClient, CacheError, DistributedLock};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AmasRepository: Send + Sync {
    async fn load_state(&self, user_id: &str) -> Result<Option<UserState>, RepositoryError>;
    async fn save_state(&self, user_id: &str, state: &UserState) -> Result<(), RepositoryError>;
    async fn load_model(&self, user_id: &str) -> Result<Option<BanditModel>, RepositoryError>;
    async fn save_model(&self, user_id: &str, model: &BanditModel) -> Result<(), RepositoryError>;
    async fn delete_model(&self, user_id: &str) -> Result<(), RepositoryError>;

    /// Process-wide state such as pending rewards or optimizer history,
    /// stored as JSON under a fixed name.
    async fn load_snapshot(&self, name: &str) -> Result<Option<serde_json::Value>, RepositoryError>;
    async fn save_snapshot(&self, name: &str, payload: &serde_json::Value) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait UserStateProvider: Send + Sync {
    async fn get_user_state(&self, user_id: &str) -> Option<UserState>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: i64,
    payload: T,
}

/// Cache-aside wrapper. Cached entries are stamped with the key's version
/// counter as read before loading; writers bump the counter after writing
/// through, so any entry filled from pre-write data is discarded on read.
pub struct CachedRepository {
    inner: Arc<dyn AmasRepository>,
    cache: Arc<dyn CacheClient>,
    config: CacheConfig,
    metrics: Arc<AmasMetrics>,
}

impl CachedRepository {
    pub fn new(
        inner: Arc<dyn AmasRepository>,
        cache: Arc<dyn CacheClient>,
        config: CacheConfig,
        metrics: Arc<AmasMetrics>,
    ) -> Self {
        Self {
            inner,
            cache,
            config,
            metrics,
        }
    }

    pub fn inner(&self) -> &Arc<dyn AmasRepository> {
        &self.inner
    }

    pub async fn invalidate_cache(&self, user_id: &str) {
        let keys = [amas_state_key(user_id), amas_model_key(user_id)];
        join_all(keys.iter().map(|key| self.invalidate_key(key))).await;
    }

    fn degrade(&self, key: &str, op: &'static str, error: &CacheError) {
        AmasMetrics::incr(&self.metrics.cache_degradations);
        debug!(key = %key, op = op, error = %error, "Cache unavailable, using repository directly");
    }

    async fn invalidate_key(&self, key: &str) {
        if let Err(e) = self.cache.delete(key).await {
            self.degrade(key, "delete", &e);
        }
        let version_key = amas_version_key(key);
        if let Err(e) = self.cache.incr(&version_key).await {
            self.degrade(key, "incr", &e);
            return;
        }
        self.touch_version(key, &version_key).await;
    }

    /// Version counters must outlive every envelope stamped from them, so
    /// their TTL is twice the longest jittered envelope TTL.
    fn version_ttl(&self) -> Duration {
        let longest = self.config.state_ttl_secs.max(self.config.model_ttl_secs);
        Duration::from_secs(longest.saturating_mul(2).max(1))
    }

    async fn touch_version(&self, key: &str, version_key: &str) {
        if let Err(e) = self.cache.expire(version_key, self.version_ttl()).await {
            self.degrade(key, "expire", &e);
        }
    }

    async fn current_version(&self, key: &str) -> Result<i64, CacheError> {
        let raw = self.cache.get(&amas_version_key(key)).await?;
        Ok(raw.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0))
    }

    async fn cached_value<T>(&self, key: &str, min_version: i64) -> Result<Option<T>, CacheError>
    where
        T: DeserializeOwned,
    {
        let Some(raw) = self.cache.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Envelope<T>>(&raw) {
            Ok(envelope) if envelope.version >= min_version => Ok(Some(envelope.payload)),
            Ok(envelope) => {
                debug!(key = %key, cached = envelope.version, current = min_version, "Discarding stale cache entry");
                Ok(None)
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Discarding unreadable cache entry");
                Ok(None)
            }
        }
    }

    async fn fill<T>(&self, key: &str, version: i64, value: &T, ttl: Duration)
    where
        T: Serialize + Sync,
    {
        let envelope = Envelope {
            version,
            payload: value,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                debug!(key = %key, error = %e, "Failed to encode cache entry");
                return;
            }
        };
        let ttl = apply_ttl_jitter(ttl, self.config.jitter_ratio);
        if let Err(e) = self.cache.set(key, &payload, Some(ttl)).await {
            self.degrade(key, "set", &e);
            return;
        }
        if version > 0 {
            self.touch_version(key, &amas_version_key(key)).await;
        }
    }

    async fn read_through<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        load: F,
    ) -> Result<Option<T>, RepositoryError>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<Option<T>, RepositoryError>> + Send,
    {
        let version = match self.current_version(key).await {
            Ok(v) => v,
            Err(e) => {
                self.degrade(key, "version", &e);
                return load().await;
            }
        };
        match self.cached_value::<T>(key, version).await {
            Ok(Some(value)) => {
                AmasMetrics::incr(&self.metrics.cache_hits);
                return Ok(Some(value));
            }
            Ok(None) => AmasMetrics::incr(&self.metrics.cache_misses),
            Err(e) => {
                self.degrade(key, "get", &e);
                return load().await;
            }
        }

        let lock = DistributedLock::acquire_with_backoff(
            Arc::clone(&self.cache),
            &amas_lock_key(key),
            Duration::from_millis(self.config.lock_ttl_ms),
            self.config.lock_retry_attempts,
            Duration::from_millis(self.config.lock_backoff_min_ms),
            Duration::from_millis(self.config.lock_backoff_max_ms),
        )
        .await;

        match lock {
            Ok(Some(lock)) => {
                let result = match self.cached_value::<T>(key, version).await {
                    Ok(Some(value)) => Ok(Some(value)),
                    _ => {
                        let loaded = load().await;
                        if let Ok(Some(value)) = &loaded {
                            self.fill(key, version, value, ttl).await;
                        }
                        loaded
                    }
                };
                if let Err(e) = lock.release().await {
                    self.degrade(key, "unlock", &e);
                }
                result
            }
            Ok(None) => {
                if let Ok(Some(value)) = self.cached_value::<T>(key, version).await {
                    return Ok(Some(value));
                }
                debug!(key = %key, "Cache lock contended, reading repository directly");
                load().await
            }
            Err(e) => {
                self.degrade(key, "lock", &e);
                load().await
            }
        }
    }
}

#[async_trait]
impl AmasRepository for CachedRepository {
    async fn load_state(&self, user_id: &str) -> Result<Option<UserState>, RepositoryError> {
        let key = amas_state_key(user_id);
        let ttl = Duration::from_secs(self.config.state_ttl_secs);
        self.read_through(&key, ttl, || self.inner.load_state(user_id))
            .await
    }

    async fn save_state(&self, user_id: &str, state: &UserState) -> Result<(), RepositoryError> {
        let key = amas_state_key(user_id);
        if let Err(e) = self.cache.delete(&key).await {
            self.degrade(&key, "delete", &e);
        }
        self.inner.save_state(user_id, state).await?;
        self.invalidate_key(&key).await;
        Ok(())
    }

    async fn load_model(&self, user_id: &str) -> Result<Option<BanditModel>, RepositoryError> {
        let key = amas_model_key(user_id);
        let ttl = Duration::from_secs(self.config.model_ttl_secs);
        let persisted = self
            .read_through(&key, ttl, move || async move {
                let model = self.inner.load_model(user_id).await?;
                Ok::<_, RepositoryError>(model.map(PersistedBanditModel::from))
            })
            .await?;
        Ok(persisted.map(PersistedBanditModel::into_current))
    }

    async fn save_model(&self, user_id: &str, model: &BanditModel) -> Result<(), RepositoryError> {
        let key = amas_model_key(user_id);
        if let Err(e) = self.cache.delete(&key).await {
            self.degrade(&key, "delete", &e);
        }
        self.inner.save_model(user_id, model).await?;
        self.invalidate_key(&key).await;
        Ok(())
    }

    async fn delete_model(&self, user_id: &str) -> Result<(), RepositoryError> {
        let key = amas_model_key(user_id);
        if let Err(e) = self.cache.delete(&key).await {
            self.degrade(&key, "delete", &e);
        }
        self.inner.delete_model(user_id).await?;
        self.invalidate_key(&key).await;
        Ok(())
    }

    async fn load_snapshot(&self, name: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
        self.inner.load_snapshot(name).await
    }

    async fn save_snapshot(&self, name: &str, payload: &serde_json::Value) -> Result<(), RepositoryError> {
        self.inner.save_snapshot(name, payload).await
    }
}

#[async_trait]
impl UserStateProvider for CachedRepository {
    async fn get_user_state(&self, user_id: &str) -> Option<UserState> {
        match self.load_state(user_id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to load user state");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::db::memory::MemoryRepository;

    fn setup() -> (Arc<MemoryRepository>, Arc<MemoryCache>, CachedRepository, Arc<AmasMetrics>) {
        let repo = Arc::new(MemoryRepository::new());
        let cache = Arc::new(MemoryCache::new());
        let metrics = Arc::new(AmasMetrics::new());
        let cached = CachedRepository::new(
            repo.clone(),
            cache.clone(),
            CacheConfig::default(),
            Arc::clone(&metrics),
        );
        (repo, cache, cached, metrics)
    }

    fn state(attention: f64) -> UserState {
        UserState {
            attention,
            ts: 1,
            ..UserState::default()
        }
    }

    #[tokio::test]
    async fn second_read_is_a_hit() {
        let (repo, _cache, cached, metrics) = setup();
        repo.save_state("u1", &state(0.4)).await.unwrap();

        assert_eq!(cached.load_state("u1").await.unwrap().unwrap().attention, 0.4);
        assert_eq!(cached.load_state("u1").await.unwrap().unwrap().attention, 0.4);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(repo.state_loads(), 1);
    }

    #[tokio::test]
    async fn save_invalidates_cached_entry() {
        let (_repo, _cache, cached, _metrics) = setup();
        cached.save_state("u1", &state(0.4)).await.unwrap();
        cached.load_state("u1").await.unwrap();
        cached.save_state("u1", &state(0.9)).await.unwrap();
        assert_eq!(cached.load_state("u1").await.unwrap().unwrap().attention, 0.9);
    }

    #[tokio::test]
    async fn entry_older_than_version_is_ignored() {
        let (repo, cache, cached, _metrics) = setup();
        repo.save_state("u1", &state(0.4)).await.unwrap();
        cached.load_state("u1").await.unwrap();

        // A writer that bypasses this instance still bumps the counter.
        repo.save_state("u1", &state(0.8)).await.unwrap();
        cache.incr(&amas_version_key(&amas_state_key("u1"))).await.unwrap();

        assert_eq!(cached.load_state("u1").await.unwrap().unwrap().attention, 0.8);
    }

    #[tokio::test]
    async fn cache_outage_degrades_to_repository() {
        let (repo, cache, cached, metrics) = setup();
        cache.set_available(false);
        cached.save_state("u1", &state(0.6)).await.unwrap();
        assert_eq!(cached.load_state("u1").await.unwrap().unwrap().attention, 0.6);
        assert!(repo.load_state("u1").await.unwrap().is_some());
        assert!(metrics.snapshot().cache_degradations > 0);
    }

    #[tokio::test]
    async fn model_round_trips_through_cache() {
        let (_repo, _cache, cached, _metrics) = setup();
        let model = crate::amas::decision::LinUCBModel::new(4, 1.0, 0.5, 100)
            .model()
            .clone();
        cached.save_model("u1", &model).await.unwrap();
        let first = cached.load_model("u1").await.unwrap().unwrap();
        let second = cached.load_model("u1").await.unwrap().unwrap();
        for loaded in [first, second] {
            assert_eq!(loaded.d, 4);
            assert_eq!(loaded.a, model.a);
            assert_eq!(loaded.l.len(), 16);
            assert!((loaded.l[0] - model.l[0]).abs() < 1e-12);
        }
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let (repo, _cache, cached, _metrics) = setup();
        repo.save_state("u1", &state(0.4)).await.unwrap();
        cached.load_state("u1").await.unwrap();
        cached.invalidate_cache("u1").await;
        cached.load_state("u1").await.unwrap();
        assert_eq!(repo.state_loads(), 2);
    }
}
