use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{RateLimitBackend, RateLimitError};

// Idle entries are swept at most once per interval.
const SWEEP_INTERVAL_MS: i64 = 60_000;

struct Bucket {
    tokens: f64,
    updated_ms: i64,
    capacity: f64,
    refill_per_sec: f64,
}

impl Bucket {
    fn refill(&mut self, now_ms: i64) {
        let elapsed = (now_ms - self.updated_ms).max(0) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.updated_ms = self.updated_ms.max(now_ms);
    }
}

struct Window {
    events: VecDeque<i64>,
    window_ms: i64,
}

impl Window {
    fn prune(&mut self, now_ms: i64) {
        while self.events.front().is_some_and(|&ts| ts <= now_ms - self.window_ms) {
            self.events.pop_front();
        }
    }
}

struct Counter {
    value: u64,
    expires_ms: i64,
}

/// Per-process backend. Each key is updated under its dashmap shard lock.
///
/// Full buckets, empty windows, idle gauges and expired counters are dropped,
/// so the maps only hold keys with live state.
#[derive(Default)]
pub struct MemoryRateLimitBackend {
    buckets: DashMap<String, Bucket>,
    windows: DashMap<String, Window>,
    gauges: DashMap<String, u64>,
    counters: DashMap<String, Counter>,
    last_sweep_ms: AtomicI64,
}

impl MemoryRateLimitBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.buckets.len() + self.windows.len() + self.gauges.len() + self.counters.len()
    }

    /// Removes every entry that no longer carries state at `now_ms`.
    pub fn purge(&self, now_ms: i64) {
        self.buckets.retain(|_, bucket| {
            bucket.refill(now_ms);
            bucket.tokens < bucket.capacity
        });
        self.windows.retain(|_, window| {
            window.prune(now_ms);
            !window.events.is_empty()
        });
        self.gauges.retain(|_, current| *current > 0);
        self.counters.retain(|_, counter| counter.expires_ms > now_ms);
    }

    // Must run before any entry guard is taken: retain locks every shard.
    fn maybe_sweep(&self, now_ms: i64) {
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms - last < SWEEP_INTERVAL_MS {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.purge(now_ms);
        }
    }
}

#[async_trait]
impl RateLimitBackend for MemoryRateLimitBackend {
    async fn token_bucket_allow(
        &self,
        key: &str,
        capacity: u64,
        refill_per_sec: f64,
        requested: u64,
        now_ms: i64,
    ) -> Result<bool, RateLimitError> {
        self.maybe_sweep(now_ms);
        let capacity = capacity as f64;
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            updated_ms: now_ms,
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
        });
        bucket.capacity = capacity;
        bucket.refill_per_sec = refill_per_sec.max(0.0);
        bucket.refill(now_ms);
        if bucket.tokens >= requested as f64 {
            bucket.tokens -= requested as f64;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn token_bucket_refund(&self, key: &str, amount: u64) -> Result<(), RateLimitError> {
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            bucket.tokens = (bucket.tokens + amount as f64).min(bucket.capacity);
        }
        Ok(())
    }

    async fn sliding_window_allow(
        &self,
        key: &str,
        max_req: u64,
        window_ms: i64,
        now_ms: i64,
        _expiration_secs: u64,
    ) -> Result<bool, RateLimitError> {
        self.maybe_sweep(now_ms);
        let mut window = self.windows.entry(key.to_string()).or_insert(Window {
            events: VecDeque::new(),
            window_ms,
        });
        window.window_ms = window_ms;
        window.prune(now_ms);
        if window.events.len() as u64 >= max_req {
            return Ok(false);
        }
        window.events.push_back(now_ms);
        Ok(true)
    }

    async fn sliding_window_undo(&self, key: &str, now_ms: i64) -> Result<(), RateLimitError> {
        let emptied = match self.windows.get_mut(key) {
            Some(mut window) => {
                if let Some(pos) = window.events.iter().rposition(|&ts| ts == now_ms) {
                    window.events.remove(pos);
                }
                window.events.is_empty()
            }
            None => false,
        };
        if emptied {
            self.windows.remove_if(key, |_, window| window.events.is_empty());
        }
        Ok(())
    }

    async fn concurrency_acquire(&self, key: &str, max: u64) -> Result<bool, RateLimitError> {
        let mut current = self.gauges.entry(key.to_string()).or_insert(0);
        if *current >= max {
            return Ok(false);
        }
        *current += 1;
        Ok(true)
    }

    async fn concurrency_release(&self, key: &str) -> Result<(), RateLimitError> {
        let idle = match self.gauges.get_mut(key) {
            Some(mut current) => {
                *current = current.saturating_sub(1);
                *current == 0
            }
            None => false,
        };
        if idle {
            self.gauges.remove_if(key, |_, current| *current == 0);
        }
        Ok(())
    }

    async fn concurrency_current(&self, key: &str) -> Result<u64, RateLimitError> {
        Ok(self.gauges.get(key).map(|v| *v).unwrap_or(0))
    }

    async fn counter_add_within(
        &self,
        key: &str,
        amount: u64,
        limit: u64,
        ttl_secs: u64,
        now_ms: i64,
    ) -> Result<bool, RateLimitError> {
        self.maybe_sweep(now_ms);
        let mut counter = self.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_ms: now_ms + ttl_secs as i64 * 1000,
        });
        if counter.expires_ms <= now_ms {
            counter.value = 0;
            counter.expires_ms = now_ms + ttl_secs as i64 * 1000;
        }
        if counter.value.saturating_add(amount) > limit {
            return Ok(false);
        }
        counter.value += amount;
        Ok(true)
    }

    async fn counter_add(&self, key: &str, amount: u64, ttl_secs: u64, now_ms: i64) -> Result<(), RateLimitError> {
        self.maybe_sweep(now_ms);
        let mut counter = self.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_ms: now_ms + ttl_secs as i64 * 1000,
        });
        if counter.expires_ms <= now_ms {
            counter.value = 0;
            counter.expires_ms = now_ms + ttl_secs as i64 * 1000;
        }
        counter.value = counter.value.saturating_add(amount);
        Ok(())
    }

    async fn counter_sub(&self, key: &str, amount: u64) -> Result<(), RateLimitError> {
        let drained = match self.counters.get_mut(key) {
            Some(mut counter) => {
                counter.value = counter.value.saturating_sub(amount);
                counter.value == 0
            }
            None => false,
        };
        if drained {
            self.counters.remove_if(key, |_, counter| counter.value == 0);
        }
        Ok(())
    }

    async fn counter_get(&self, key: &str, now_ms: i64) -> Result<u64, RateLimitError> {
        Ok(self
            .counters
            .get(key)
            .filter(|c| c.expires_ms > now_ms)
            .map(|c| c.value)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::super::RateLimitStore;
    use super::*;
    use std::sync::Arc;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[tokio::test]
    async fn test_token_bucket_admits_at_most_capacity_plus_refill() {
        let backend = MemoryRateLimitBackend::new();
        let (capacity, rate) = (10u64, 2.0f64);
        let mut rng = StdRng::seed_from_u64(7);
        let mut now = 0i64;
        let mut admitted = 0u64;
        for _ in 0..2_000 {
            now += rng.random_range(0..20);
            if backend.token_bucket_allow("tb", capacity, rate, 1, now).await.unwrap() {
                admitted += 1;
            }
        }
        let elapsed_secs = now as f64 / 1000.0;
        assert!(admitted as f64 <= capacity as f64 + elapsed_secs * rate);
        assert!(admitted >= capacity);
    }

    #[tokio::test]
    async fn test_token_bucket_all_or_nothing() {
        let backend = MemoryRateLimitBackend::new();
        assert!(backend.token_bucket_allow("tb", 5, 0.0, 3, 0).await.unwrap());
        assert!(!backend.token_bucket_allow("tb", 5, 0.0, 3, 0).await.unwrap());
        assert!(backend.token_bucket_allow("tb", 5, 0.0, 2, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_sliding_window_never_exceeds_max_in_window() {
        let backend = MemoryRateLimitBackend::new();
        let window_ms = 1_000;
        let mut rng = StdRng::seed_from_u64(11);
        let mut admitted: Vec<i64> = Vec::new();
        let mut now = 0i64;
        for _ in 0..500 {
            now += rng.random_range(0..30);
            if backend.sliding_window_allow("sw", 5, window_ms, now, 2).await.unwrap() {
                admitted.push(now);
            }
            let in_window = admitted.iter().filter(|&&t| t > now - window_ms && t <= now).count();
            assert!(in_window <= 5, "{} events in window at {}", in_window, now);
        }
    }

    #[tokio::test]
    async fn test_sliding_window_boundary_is_exclusive() {
        let backend = MemoryRateLimitBackend::new();
        assert!(backend.sliding_window_allow("sw", 1, 1_000, 0, 2).await.unwrap());
        assert!(!backend.sliding_window_allow("sw", 1, 1_000, 999, 2).await.unwrap());
        assert!(backend.sliding_window_allow("sw", 1, 1_000, 1_000, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrency_gauge_is_bounded() {
        let backend = MemoryRateLimitBackend::new();
        assert!(backend.concurrency_acquire("c", 2).await.unwrap());
        assert!(backend.concurrency_acquire("c", 2).await.unwrap());
        assert!(!backend.concurrency_acquire("c", 2).await.unwrap());
        backend.concurrency_release("c").await.unwrap();
        assert_eq!(backend.concurrency_current("c").await.unwrap(), 1);
        backend.concurrency_release("c").await.unwrap();
        backend.concurrency_release("c").await.unwrap();
        assert_eq!(backend.concurrency_current("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_counter_expires() {
        let backend = MemoryRateLimitBackend::new();
        backend.counter_add("n", 5, 1, 0).await.unwrap();
        assert_eq!(backend.counter_get("n", 999).await.unwrap(), 5);
        assert_eq!(backend.counter_get("n", 1_000).await.unwrap(), 0);
        assert!(backend.counter_add_within("n", 3, 3, 1, 1_000).await.unwrap());
        assert!(!backend.counter_add_within("n", 1, 3, 1, 1_500).await.unwrap());
    }

    #[tokio::test]
    async fn test_minute_buckets_do_not_accumulate() {
        let backend = Arc::new(MemoryRateLimitBackend::new());
        let store = RateLimitStore::new(backend.clone(), chrono_tz::UTC);
        let day_start = 1_704_067_200_000;
        for minute in 0..1_000 {
            let now = day_start + minute * 60_000;
            store.record_tokens("user:1", 10, now).await;
            assert!(store.sliding_window_allow(&format!("rpm:user:{}", minute), 5, 60, now).await);
        }
        // the live minute, the one before it and the day bucket
        assert!(backend.counters.len() <= 3, "{} counters", backend.counters.len());
        assert!(backend.windows.len() <= 2, "{} windows", backend.windows.len());
        assert!(store.check_tpd("user:1", 10_000, 0, day_start + 999 * 60_000).await);
        assert!(!store.check_tpd("user:1", 10_000, 1, day_start + 999 * 60_000).await);
    }

    #[tokio::test]
    async fn test_purge_drops_idle_state() {
        let backend = MemoryRateLimitBackend::new();
        assert!(backend.token_bucket_allow("tb", 2, 1.0, 1, 0).await.unwrap());
        assert!(backend.sliding_window_allow("sw", 5, 1_000, 0, 2).await.unwrap());
        assert!(backend.concurrency_acquire("c", 1).await.unwrap());
        backend.counter_add("n", 1, 1, 0).await.unwrap();
        assert_eq!(backend.tracked_keys(), 4);

        backend.concurrency_release("c").await.unwrap();
        assert_eq!(backend.tracked_keys(), 3);
        backend.purge(10_000);
        assert_eq!(backend.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_undo_restores_previous_state() {
        let backend = MemoryRateLimitBackend::new();
        assert!(backend.sliding_window_allow("sw", 1, 1_000, 5, 2).await.unwrap());
        backend.sliding_window_undo("sw", 5).await.unwrap();
        assert!(backend.sliding_window_allow("sw", 1, 1_000, 6, 2).await.unwrap());

        assert!(backend.counter_add_within("n", 1, 1, 60, 0).await.unwrap());
        backend.counter_sub("n", 1).await.unwrap();
        assert!(backend.counter_add_within("n", 1, 1, 60, 0).await.unwrap());

        assert!(backend.token_bucket_allow("tb", 1, 0.0, 1, 0).await.unwrap());
        backend.token_bucket_refund("tb", 1).await.unwrap();
        assert!(backend.token_bucket_allow("tb", 1, 0.0, 1, 0).await.unwrap());
        assert!(!backend.token_bucket_allow("tb", 1, 0.0, 1, 0).await.unwrap());
    }
}
