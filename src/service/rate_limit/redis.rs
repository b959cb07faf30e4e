use async_trait::async_trait;
use bb8_redis::redis::{cmd, RedisError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{RateLimitBackend, RateLimitError};
use crate::service::redis::RedisPool;

const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end
local elapsed = math.max(0, now - ts) / 1000
tokens = math.min(capacity, tokens + elapsed * rate)
local allowed = 0
if tokens >= requested then
  tokens = tokens - requested
  allowed = 1
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(math.max(ts, now)), 'cap', tostring(capacity))
local ttl = 86400000
if rate > 0 then
  ttl = math.min(ttl, math.ceil(capacity / rate * 1000) + 1000)
end
redis.call('PEXPIRE', KEYS[1], ttl)
return allowed
"#;

const TOKEN_BUCKET_REFUND_SCRIPT: &str = r#"
local state = redis.call('HMGET', KEYS[1], 'tokens', 'cap')
local tokens = tonumber(state[1])
local capacity = tonumber(state[2])
if tokens == nil or capacity == nil then
  return 0
end
tokens = math.min(capacity, tokens + tonumber(ARGV[1]))
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens))
return 1
"#;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local max_req = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
if redis.call('ZCARD', KEYS[1]) >= max_req then
  return 0
end
redis.call('ZADD', KEYS[1], now, ARGV[5])
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[4]))
return 1
"#;

const SLIDING_WINDOW_UNDO_SCRIPT: &str = r#"
local members = redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[1], ARGV[1], 'LIMIT', 0, 1)
if #members == 0 then
  return 0
end
redis.call('ZREM', KEYS[1], members[1])
return 1
"#;

const CONCURRENCY_ACQUIRE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
  return 0
end
redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
return 1
"#;

const CONCURRENCY_RELEASE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 1 then
  redis.call('DEL', KEYS[1])
  return 0
end
return redis.call('DECR', KEYS[1])
"#;

const COUNTER_ADD_WITHIN_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
if current + amount > tonumber(ARGV[2]) then
  return 0
end
redis.call('INCRBY', KEYS[1], amount)
if redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
end
return 1
"#;

const COUNTER_ADD_SCRIPT: &str = r#"
redis.call('INCRBY', KEYS[1], tonumber(ARGV[1]))
if redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
end
return 1
"#;

const COUNTER_SUB_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
if current <= amount then
  redis.call('DEL', KEYS[1])
  return 0
end
return redis.call('DECRBY', KEYS[1], amount)
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Script {
    TokenBucket,
    TokenBucketRefund,
    SlidingWindow,
    SlidingWindowUndo,
    ConcurrencyAcquire,
    ConcurrencyRelease,
    CounterAddWithin,
    CounterAdd,
    CounterSub,
}

impl Script {
    fn source(self) -> &'static str {
        match self {
            Script::TokenBucket => TOKEN_BUCKET_SCRIPT,
            Script::TokenBucketRefund => TOKEN_BUCKET_REFUND_SCRIPT,
            Script::SlidingWindow => SLIDING_WINDOW_SCRIPT,
            Script::SlidingWindowUndo => SLIDING_WINDOW_UNDO_SCRIPT,
            Script::ConcurrencyAcquire => CONCURRENCY_ACQUIRE_SCRIPT,
            Script::ConcurrencyRelease => CONCURRENCY_RELEASE_SCRIPT,
            Script::CounterAddWithin => COUNTER_ADD_WITHIN_SCRIPT,
            Script::CounterAdd => COUNTER_ADD_SCRIPT,
            Script::CounterSub => COUNTER_SUB_SCRIPT,
        }
    }
}

/// The server answers `NOSCRIPT` when the digest is unknown, e.g. after a restart or `SCRIPT FLUSH`.
fn is_noscript(code: Option<&str>, message: &str) -> bool {
    code == Some("NOSCRIPT") || message.contains("NOSCRIPT") || message.starts_with("NoScript")
}

enum EvalError {
    Pool(String),
    Redis(RedisError),
}

impl EvalError {
    fn is_noscript(&self) -> bool {
        match self {
            EvalError::Pool(_) => false,
            EvalError::Redis(e) => is_noscript(e.code(), &e.to_string()),
        }
    }
}

impl From<EvalError> for RateLimitError {
    fn from(err: EvalError) -> Self {
        match err {
            EvalError::Pool(msg) => RateLimitError::Backend(msg),
            EvalError::Redis(e) => RateLimitError::Backend(e.to_string()),
        }
    }
}

// Concurrency gauges expire so a crashed process cannot hold slots forever.
const CONCURRENCY_TTL_SECS: u64 = 600;

/// Shared-store backend. Scripts are loaded on first use and invoked by digest.
pub struct RedisRateLimitBackend {
    pool: RedisPool,
    key_prefix: String,
    digests: DashMap<Script, String>,
    sequence: AtomicU64,
}

impl RedisRateLimitBackend {
    pub fn new(pool: RedisPool, key_prefix: &str) -> Self {
        Self {
            pool,
            key_prefix: format!("{}rl:", key_prefix),
            digests: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn load(&self, script: Script) -> Result<String, RateLimitError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        let digest: String = cmd("SCRIPT")
            .arg("LOAD")
            .arg(script.source())
            .query_async(&mut *conn)
            .await
            .map_err(|e| RateLimitError::Script(e.to_string()))?;
        self.digests.insert(script, digest.clone());
        Ok(digest)
    }

    async fn eval_once(&self, digest: &str, key: &str, args: &[String]) -> Result<i64, EvalError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| EvalError::Pool(format!("pool unavailable: {}", e)))?;
        let mut command = cmd("EVALSHA");
        command.arg(digest).arg(1).arg(key);
        for arg in args {
            command.arg(arg);
        }
        command.query_async(&mut *conn).await.map_err(EvalError::Redis)
    }

    /// EVALSHA; on NOSCRIPT the script is reloaded and the call is retried exactly once.
    async fn eval(&self, script: Script, key: &str, args: &[String]) -> Result<i64, RateLimitError> {
        let cached = self.digests.get(&script).map(|d| d.value().clone());
        let digest = match cached {
            Some(d) => d,
            None => self.load(script).await?,
        };
        match self.eval_once(&digest, key, args).await {
            Ok(v) => Ok(v),
            Err(e) if e.is_noscript() => {
                cyder_tools::log::info!("rate limit script {:?} missing on server, reloading", script);
                let digest = self.load(script).await?;
                Ok(self.eval_once(&digest, key, args).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RateLimitBackend for RedisRateLimitBackend {
    async fn token_bucket_allow(
        &self,
        key: &str,
        capacity: u64,
        refill_per_sec: f64,
        requested: u64,
        now_ms: i64,
    ) -> Result<bool, RateLimitError> {
        let args = [
            capacity.to_string(),
            refill_per_sec.to_string(),
            requested.to_string(),
            now_ms.to_string(),
        ];
        Ok(self.eval(Script::TokenBucket, &self.full_key(key), &args).await? == 1)
    }

    async fn token_bucket_refund(&self, key: &str, amount: u64) -> Result<(), RateLimitError> {
        self.eval(Script::TokenBucketRefund, &self.full_key(key), &[amount.to_string()])
            .await?;
        Ok(())
    }

    async fn sliding_window_allow(
        &self,
        key: &str,
        max_req: u64,
        window_ms: i64,
        now_ms: i64,
        expiration_secs: u64,
    ) -> Result<bool, RateLimitError> {
        let member = format!("{}-{}", now_ms, self.sequence.fetch_add(1, Ordering::Relaxed));
        let args = [
            max_req.to_string(),
            window_ms.to_string(),
            now_ms.to_string(),
            expiration_secs.max(1).to_string(),
            member,
        ];
        Ok(self.eval(Script::SlidingWindow, &self.full_key(key), &args).await? == 1)
    }

    async fn sliding_window_undo(&self, key: &str, now_ms: i64) -> Result<(), RateLimitError> {
        self.eval(Script::SlidingWindowUndo, &self.full_key(key), &[now_ms.to_string()])
            .await?;
        Ok(())
    }

    async fn concurrency_acquire(&self, key: &str, max: u64) -> Result<bool, RateLimitError> {
        let args = [max.to_string(), CONCURRENCY_TTL_SECS.to_string()];
        Ok(self.eval(Script::ConcurrencyAcquire, &self.full_key(key), &args).await? == 1)
    }

    async fn concurrency_release(&self, key: &str) -> Result<(), RateLimitError> {
        self.eval(Script::ConcurrencyRelease, &self.full_key(key), &[]).await?;
        Ok(())
    }

    async fn concurrency_current(&self, key: &str) -> Result<u64, RateLimitError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        let value: Option<u64> = cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut *conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        Ok(value.unwrap_or(0))
    }

    async fn counter_add_within(
        &self,
        key: &str,
        amount: u64,
        limit: u64,
        ttl_secs: u64,
        _now_ms: i64,
    ) -> Result<bool, RateLimitError> {
        let args = [amount.to_string(), limit.to_string(), ttl_secs.max(1).to_string()];
        Ok(self.eval(Script::CounterAddWithin, &self.full_key(key), &args).await? == 1)
    }

    async fn counter_add(&self, key: &str, amount: u64, ttl_secs: u64, _now_ms: i64) -> Result<(), RateLimitError> {
        let args = [amount.to_string(), ttl_secs.max(1).to_string()];
        self.eval(Script::CounterAdd, &self.full_key(key), &args).await?;
        Ok(())
    }

    async fn counter_sub(&self, key: &str, amount: u64) -> Result<(), RateLimitError> {
        self.eval(Script::CounterSub, &self.full_key(key), &[amount.to_string()]).await?;
        Ok(())
    }

    async fn counter_get(&self, key: &str, _now_ms: i64) -> Result<u64, RateLimitError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        let value: Option<u64> = cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut *conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        Ok(value.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noscript_detection() {
        assert!(is_noscript(Some("NOSCRIPT"), "No matching script"));
        assert!(is_noscript(None, "NOSCRIPT No matching script. Please use EVAL."));
        assert!(is_noscript(None, "NoScript: No matching script"));
        assert!(!is_noscript(Some("ERR"), "broken pipe"));
        assert!(!EvalError::Pool("NOSCRIPT".to_string()).is_noscript());
    }

    #[test]
    fn test_scripts_use_single_key() {
        for script in [
            Script::TokenBucket,
            Script::TokenBucketRefund,
            Script::SlidingWindow,
            Script::SlidingWindowUndo,
            Script::ConcurrencyAcquire,
            Script::ConcurrencyRelease,
            Script::CounterAddWithin,
            Script::CounterAdd,
            Script::CounterSub,
        ] {
            assert!(!script.source().contains("KEYS[2]"), "{:?}", script);
        }
    }
}
