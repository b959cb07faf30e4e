use async_trait::async_trait;
use bb8_redis::redis::{cmd, pipe, RedisError};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::{metrics::CacheMetrics, types::CacheEntry, CacheBackend, CacheError};
use crate::service::redis::RedisPool;

#[derive(Debug, Error)]
pub enum RedisCacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("Codec error: {0}")]
    Codec(#[from] CacheError),
    #[error("Pool error: {0}")]
    Pool(#[from] bb8_redis::bb8::RunError<RedisError>),
}

fn encode<T: Serialize + Clone + DeserializeOwned>(entry: &CacheEntry<T>) -> Result<Vec<u8>, CacheError> {
    Ok(bincode::serde::encode_to_vec(entry, bincode::config::standard())?)
}

fn decode<T: Serialize + Clone + DeserializeOwned>(bytes: &[u8]) -> Result<CacheEntry<T>, CacheError> {
    let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(entry)
}

/// Redis cache backend. Values are bincode-encoded `CacheEntry` blobs.
#[derive(Clone)]
pub struct RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static + Clone,
{
    pool: RedisPool,
    metrics: Arc<CacheMetrics>,
    key_prefix: String,
    _phantom: PhantomData<T>,
}

impl<T> RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static + Clone,
{
    pub fn new(pool: RedisPool, key_prefix: String, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            pool,
            metrics,
            key_prefix,
            _phantom: PhantomData,
        }
    }

    fn get_full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl<T> CacheBackend<T> for RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static + Clone,
{
    type Error = RedisCacheError;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error> {
        let mut conn = self.pool.get().await?;
        let raw: Option<Vec<u8>> = cmd("GET")
            .arg(self.get_full_key(key))
            .query_async(&mut *conn)
            .await?;

        match raw {
            Some(bytes) => match decode::<T>(&bytes) {
                Ok(entry) => {
                    self.metrics.record_hit();
                    Ok(Some(Arc::new(entry)))
                }
                Err(e) => {
                    // Stale layout from an older build. Treat as a miss.
                    self.metrics.record_error();
                    cyder_tools::log::warn!("dropping undecodable cache value for {}: {}", key, e);
                    Ok(None)
                }
            },
            None => {
                self.metrics.record_miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error> {
        let bytes = encode(&*value)?;
        let mut conn = self.pool.get().await?;
        let full_key = self.get_full_key(key);

        let mut command = cmd("SET");
        command.arg(&full_key).arg(bytes);
        if let Some(ttl) = ttl {
            command.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = command.query_async(&mut *conn).await?;
        self.metrics.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        let mut conn = self.pool.get().await?;
        let _: () = cmd("DEL").arg(self.get_full_key(key)).query_async(&mut *conn).await?;
        self.metrics.record_delete();
        Ok(())
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        let mut conn = self.pool.get().await?;
        let pattern = format!("{}*", self.key_prefix);

        let mut keys_to_delete: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await?;
            keys_to_delete.extend(keys);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        if !keys_to_delete.is_empty() {
            let mut batch = pipe();
            for key in &keys_to_delete {
                batch.cmd("DEL").arg(key).ignore();
            }
            let _: () = batch.query_async(&mut *conn).await?;
            cyder_tools::log::info!(
                "Cleared {} keys from Redis cache with prefix '{}'",
                keys_to_delete.len(),
                self.key_prefix
            );
        }
        Ok(())
    }
}
