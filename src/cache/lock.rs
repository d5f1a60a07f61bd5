use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::cache::{CacheClient, CacheError};

/// Token-scoped lock over `SET NX PX`. Release only removes the key while it
/// still holds this holder's token.
pub struct DistributedLock {
    client: Arc<dyn CacheClient>,
    key: String,
    token: String,
}

impl DistributedLock {
    pub async fn try_acquire(
        client: Arc<dyn CacheClient>,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Self>, CacheError> {
        let token = uuid::Uuid::new_v4().to_string();
        if client.set_nx(key, &token, ttl).await? {
            Ok(Some(Self {
                client,
                key: key.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Retries with a randomized backoff in `[backoff_min, backoff_max]`.
    pub async fn acquire_with_backoff(
        client: Arc<dyn CacheClient>,
        key: &str,
        ttl: Duration,
        attempts: u32,
        backoff_min: Duration,
        backoff_max: Duration,
    ) -> Result<Option<Self>, CacheError> {
        for attempt in 0..attempts.max(1) {
            if let Some(lock) = Self::try_acquire(Arc::clone(&client), key, ttl).await? {
                return Ok(Some(lock));
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(random_backoff(backoff_min, backoff_max)).await;
            }
        }
        Ok(None)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn release(self) -> Result<bool, CacheError> {
        self.client.compare_and_delete(&self.key, &self.token).await
    }
}

pub fn random_backoff(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = (max.as_millis() as u64).max(min_ms);
    Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
}
