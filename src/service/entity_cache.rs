use cyder_tools::log::{debug, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use super::cache::memory::MemoryCacheBackend;
use super::cache::metrics::{CacheMetrics, CacheMetricsSnapshot};
use super::cache::redis::RedisCacheBackend;
use super::cache::repository::CacheRepository;
use super::cache::types::{CacheEntry, CacheToken, CacheUser};
use super::cache::CacheError;
use super::redis::RedisPool;
use super::store::{Store, StoreError};
use crate::config::CacheConfig;

enum CacheKey<'a> {
    TokenByKey(&'a str),
    UserById(i64),
}

impl CacheKey<'_> {
    fn render(&self) -> String {
        match self {
            CacheKey::TokenByKey(digest) => format!("token:key:{}", digest),
            CacheKey::UserById(id) => format!("user:id:{}", id),
        }
    }
}

#[derive(Clone)]
enum AnyCacheRepo<T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static> {
    Memory(CacheRepository<T, MemoryCacheBackend<T>>),
    Redis(CacheRepository<T, RedisCacheBackend<T>>),
}

impl<T> AnyCacheRepo<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    fn create(
        ttl: Option<Duration>,
        redis: Option<(&RedisPool, &str)>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        match redis {
            Some((pool, prefix)) => AnyCacheRepo::Redis(CacheRepository::new(
                RedisCacheBackend::new(pool.clone(), format!("{}cache:", prefix), metrics),
                ttl,
            )),
            None => AnyCacheRepo::Memory(CacheRepository::new(MemoryCacheBackend::new(metrics), ttl)),
        }
    }

    async fn get_entry(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.get_entry(key).await,
            AnyCacheRepo::Redis(repo) => repo.get_entry(key).await,
        }
    }

    async fn set_positive(&self, key: &str, value: &T) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.set_positive(key, value).await,
            AnyCacheRepo::Redis(repo) => repo.set_positive(key, value).await,
        }
    }

    async fn set_negative(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.set_negative(key, ttl).await,
            AnyCacheRepo::Redis(repo) => repo.set_negative(key, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.delete(key).await,
            AnyCacheRepo::Redis(repo) => repo.delete(key).await,
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.clear().await,
            AnyCacheRepo::Redis(repo) => repo.clear().await,
        }
    }
}

/// Read-through cache for tokens (by hashed key) and users (by id).
///
/// Cache failures never fail a lookup; the store is the source of truth.
#[derive(Clone)]
pub struct EntityCache {
    tokens: AnyCacheRepo<CacheToken>,
    users: AnyCacheRepo<CacheUser>,
    negative_ttl: Duration,
    salt: String,
    metrics: Arc<CacheMetrics>,
}

impl EntityCache {
    pub fn new(config: &CacheConfig, salt: &str, redis: Option<(&RedisPool, &str)>) -> Self {
        let ttl = Some(config.ttl());
        let metrics = Arc::new(CacheMetrics::new());
        if redis.is_some() {
            info!("Using Redis cache backend.");
        } else {
            info!("Using in-memory cache backend.");
        }
        Self {
            tokens: AnyCacheRepo::create(ttl, redis, metrics.clone()),
            users: AnyCacheRepo::create(ttl, redis, metrics.clone()),
            negative_ttl: config.negative_ttl(),
            salt: salt.to_string(),
            metrics,
        }
    }

    fn hash_key(&self, key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(b":");
        hasher.update(key.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn token_by_key(&self, store: &dyn Store, key: &str) -> Result<Option<Arc<CacheToken>>, StoreError> {
        let digest = self.hash_key(key);
        let cache_key = CacheKey::TokenByKey(&digest).render();
        if let Some(hit) = self.lookup(&self.tokens, &cache_key).await {
            return Ok(hit);
        }
        let token = store.get_token_by_key(key).await?;
        self.fill(&self.tokens, &cache_key, token.as_ref()).await;
        Ok(token.map(Arc::new))
    }

    pub async fn user_by_id(&self, store: &dyn Store, id: i64) -> Result<Option<Arc<CacheUser>>, StoreError> {
        let cache_key = CacheKey::UserById(id).render();
        if let Some(hit) = self.lookup(&self.users, &cache_key).await {
            return Ok(hit);
        }
        let user = store.get_user(id).await?;
        self.fill(&self.users, &cache_key, user.as_ref()).await;
        Ok(user.map(Arc::new))
    }

    pub async fn invalidate_token(&self, key: &str) {
        let digest = self.hash_key(key);
        if let Err(e) = self.tokens.delete(&CacheKey::TokenByKey(&digest).render()).await {
            self.metrics.record_error();
            warn!("failed to invalidate token cache entry: {}", e);
        }
    }

    pub async fn invalidate_user(&self, id: i64) {
        if let Err(e) = self.users.delete(&CacheKey::UserById(id).render()).await {
            self.metrics.record_error();
            warn!("failed to invalidate user cache entry {}: {}", id, e);
        }
    }

    pub async fn clear(&self) {
        for result in [self.tokens.clear().await, self.users.clear().await] {
            if let Err(e) = result {
                self.metrics.record_error();
                warn!("failed to clear entity cache: {}", e);
            }
        }
    }

    // Some(hit) on a cache hit (positive or negative), None on miss or backend error.
    async fn lookup<T>(&self, repo: &AnyCacheRepo<T>, cache_key: &str) -> Option<Option<Arc<T>>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    {
        match repo.get_entry(cache_key).await {
            Ok(Some(entry)) => match &*entry {
                CacheEntry::Positive(value) => {
                    debug!("cache hit (positive): {}", cache_key);
                    Some(Some(value.clone()))
                }
                CacheEntry::Negative => {
                    debug!("cache hit (negative): {}", cache_key);
                    Some(None)
                }
            },
            Ok(None) => {
                debug!("cache miss: {}", cache_key);
                None
            }
            Err(e) => {
                self.metrics.record_error();
                warn!("cache read failed for {}: {}", cache_key, e);
                None
            }
        }
    }

    async fn fill<T>(&self, repo: &AnyCacheRepo<T>, cache_key: &str, value: Option<&T>)
    where
        T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    {
        let result = match value {
            Some(v) => repo.set_positive(cache_key, v).await,
            None => repo.set_negative(cache_key, self.negative_ttl).await,
        };
        if let Err(e) = result {
            self.metrics.record_error();
            warn!("cache write failed for {}: {}", cache_key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::store::MemoryStore;

    fn cache() -> EntityCache {
        EntityCache::new(&CacheConfig::default(), "salt", None)
    }

    #[tokio::test]
    async fn test_token_lookup_is_cached_until_invalidated() {
        let store = MemoryStore::new();
        store
            .insert_token(&CacheToken {
                id: 1,
                key: "abc".to_string(),
                remaining_quota: 10,
                expired_time: -1,
                ..Default::default()
            })
            .await
            .unwrap();
        let cache = cache();

        let first = cache.token_by_key(&store, "abc").await.unwrap().unwrap();
        assert_eq!(first.remaining_quota, 10);

        store.debit_token(1, 4, true).await.unwrap();
        let stale = cache.token_by_key(&store, "abc").await.unwrap().unwrap();
        assert_eq!(stale.remaining_quota, 10);

        cache.invalidate_token("abc").await;
        let fresh = cache.token_by_key(&store, "abc").await.unwrap().unwrap();
        assert_eq!(fresh.remaining_quota, 6);
    }

    #[tokio::test]
    async fn test_unknown_key_is_negatively_cached() {
        let store = MemoryStore::new();
        let cache = cache();
        assert!(cache.token_by_key(&store, "nope").await.unwrap().is_none());
        assert!(cache.token_by_key(&store, "nope").await.unwrap().is_none());

        let snapshot = cache.metrics();
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.hits, 1);
    }

    #[tokio::test]
    async fn test_key_digest_is_salted() {
        let a = EntityCache::new(&CacheConfig::default(), "one", None);
        let b = EntityCache::new(&CacheConfig::default(), "two", None);
        assert_ne!(a.hash_key("k"), b.hash_key("k"));
        assert_eq!(a.hash_key("k").len(), 64);
    }
}
