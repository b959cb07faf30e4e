use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::{metrics::CacheMetrics, types::CacheEntry, CacheBackend};

#[derive(Debug, Error)]
#[error("Memory cache error: {0}")]
pub struct MemoryCacheError(String);

type Slot<T> = (Arc<CacheEntry<T>>, Option<Instant>);

#[derive(Clone)]
pub struct MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    data: Arc<DashMap<String, Slot<T>>>,
    metrics: Arc<CacheMetrics>,
}

impl<T> MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    /// Must be called inside a tokio runtime; a sweeper task evicts expired slots every minute.
    pub fn new(metrics: Arc<CacheMetrics>) -> Self {
        let backend = Self {
            data: Arc::new(DashMap::new()),
            metrics,
        };
        backend.clone().spawn_cleanup_task();
        backend
    }

    fn spawn_cleanup_task(self) {
        let data = Arc::downgrade(&self.data);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let Some(data) = data.upgrade() else { break };
                let now = Instant::now();
                let before = data.len();
                data.retain(|_, (_, expiration)| expiration.is_none_or(|exp| now < exp));
                let removed = before.saturating_sub(data.len());
                if removed > 0 {
                    cyder_tools::log::debug!("Cleaned up {} expired cache entries", removed);
                }
            }
        });
    }
}

#[async_trait]
impl<T> CacheBackend<T> for MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    type Error = MemoryCacheError;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error> {
        let found = self.data.get(key).map(|slot| slot.value().clone());
        match found {
            Some((_, Some(exp))) if Instant::now() >= exp => {
                self.data.remove(key);
                self.metrics.record_miss();
                Ok(None)
            }
            Some((value, _)) => {
                self.metrics.record_hit();
                Ok(Some(value))
            }
            None => {
                self.metrics.record_miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error> {
        let expiration = ttl.map(|d| Instant::now() + d);
        self.data.insert(key.to_string(), (value, expiration));
        self.metrics.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        self.data.remove(key);
        self.metrics.record_delete();
        Ok(())
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        self.data.clear();
        cyder_tools::log::info!("In-memory cache cleared.");
        Ok(())
    }
}
