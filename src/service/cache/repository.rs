use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::{types::CacheEntry, CacheBackend, CacheError};

/// Typed view over a backend. Cache keys are built by the caller.
pub struct CacheRepository<T, B>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    B: CacheBackend<T>,
{
    backend: B,
    default_ttl: Option<Duration>,
    _phantom: PhantomData<T>,
}

impl<T, B> CacheRepository<T, B>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    B: CacheBackend<T>,
{
    pub fn new(backend: B, default_ttl: Option<Duration>) -> Self {
        Self {
            backend,
            default_ttl,
            _phantom: PhantomData,
        }
    }

    /// Raw entry, so callers can tell a negative hit from a miss.
    pub async fn get_entry(&self, cache_key: &str) -> Result<Option<Arc<CacheEntry<T>>>, CacheError> {
        self.backend
            .get(cache_key)
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }

    pub async fn set_positive(&self, cache_key: &str, value: &T) -> Result<(), CacheError> {
        let entry = Arc::new(CacheEntry::Positive(Arc::new(value.clone())));
        self.backend
            .set(cache_key, entry, self.default_ttl)
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }

    pub async fn set_negative(&self, cache_key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.backend
            .set(cache_key, Arc::new(CacheEntry::Negative), Some(ttl))
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }

    pub async fn delete(&self, cache_key: &str) -> Result<(), CacheError> {
        self.backend
            .delete(cache_key)
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.backend
            .clear()
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }
}

impl<T, B> Clone for CacheRepository<T, B>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    B: CacheBackend<T>,
{
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            default_ttl: self.default_ttl,
            _phantom: PhantomData,
        }
    }
}
