use cyder_tools::log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::authenticator::Authenticator;
use super::classifier::ErrorClassifier;
use super::entity_cache::EntityCache;
use super::health::{HealthMonitor, HealthSettings, Prober, UpstreamProber};
use super::ledger::Ledger;
use super::limiter::GroupLimiter;
use super::metrics::RelayMetrics;
use super::pricing::PriceTable;
use super::rate_limit::redis::RedisRateLimitBackend;
use super::rate_limit::RateLimitStore;
use super::recent_calls::RecentCalls;
use super::redis::{self as redis_pool, RedisPool};
use super::registry::ChannelRegistry;
use super::store::{DbStore, MemoryStore, Store, StoreError};
use super::upstream::Upstream;
use crate::config::{CacheBackendType, FinalConfig};

/// `db_url` value that selects the in-process store.
pub const MEMORY_DB_URL: &str = "memory";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Everything a request or a background task needs, built once in `main`.
pub struct Runtime {
    pub config: FinalConfig,
    pub store: Arc<dyn Store>,
    pub cache: EntityCache,
    pub registry: Arc<ChannelRegistry>,
    pub prices: Arc<PriceTable>,
    pub rate_limits: Arc<RateLimitStore>,
    pub limiter: GroupLimiter,
    pub authenticator: Authenticator,
    pub ledger: Ledger,
    pub classifier: Arc<ErrorClassifier>,
    pub upstream: Upstream,
    pub health: Arc<HealthMonitor>,
    pub recent: RecentCalls,
    pub metrics: Arc<RelayMetrics>,
}

impl Runtime {
    /// Opens the store and redis named by `config` and loads the channel and price tables.
    pub async fn build(config: FinalConfig) -> Result<Arc<Self>, RuntimeError> {
        let store: Arc<dyn Store> = if config.db_url == MEMORY_DB_URL {
            warn!("Using the in-memory store, nothing will be persisted");
            Arc::new(MemoryStore::new())
        } else {
            let db_url = config.db_url.clone();
            let store = tokio::task::spawn_blocking(move || DbStore::connect(&db_url))
                .await
                .map_err(|e| StoreError::Task(e.to_string()))??;
            Arc::new(store)
        };
        let redis = match &config.redis {
            Some(redis_config) => redis_pool::connect(redis_config).await,
            None => None,
        };
        Self::assemble(config, store, redis, None).await
    }

    /// Wires the components. `prober` replaces the real upstream prober.
    pub async fn assemble(
        config: FinalConfig,
        store: Arc<dyn Store>,
        redis: Option<RedisPool>,
        prober: Option<Arc<dyn Prober>>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let key_prefix = config
            .redis
            .as_ref()
            .map(|r| r.key_prefix.clone())
            .unwrap_or_default();
        let cache_redis = match (&redis, &config.cache.backend) {
            (Some(pool), CacheBackendType::Redis) => Some((pool, key_prefix.as_str())),
            _ => None,
        };
        let cache = EntityCache::new(&config.cache, config.crypto_secret(), cache_redis);

        let rate_limits = Arc::new(match &redis {
            Some(pool) => {
                info!("Rate limits are shared through redis");
                RateLimitStore::new(Arc::new(RedisRateLimitBackend::new(pool.clone(), &key_prefix)), config.timezone())
            }
            None => RateLimitStore::in_memory(config.timezone()),
        });

        let registry = Arc::new(ChannelRegistry::default());
        registry.refresh(store.as_ref()).await?;
        let prices = Arc::new(PriceTable::default());
        prices.refresh(store.as_ref()).await?;

        let upstream = Upstream::new(config.proxy.as_deref(), config.relay.upstream_timeout())?;
        let classifier = Arc::new(ErrorClassifier::new(&config.relay.auto_disable_keywords));
        let metrics = Arc::new(RelayMetrics::new());
        let prober = prober.unwrap_or_else(|| {
            Arc::new(UpstreamProber::new(upstream.clone(), registry.clone(), config.health.probe_timeout()))
        });
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            store.clone(),
            classifier.clone(),
            metrics.clone(),
            prober,
            HealthSettings::from_config(&config.health, &config.relay),
        ));

        Ok(Arc::new(Self {
            limiter: GroupLimiter::new(rate_limits.clone(), config.rate_limit.clone()),
            authenticator: Authenticator::new(store.clone(), cache.clone(), prices.clone()),
            ledger: Ledger::new(store.clone(), cache.clone(), config.relay.quota_per_unit),
            recent: RecentCalls::new(config.relay.recent_call_capacity),
            config,
            store,
            cache,
            registry,
            prices,
            rate_limits,
            classifier,
            upstream,
            health,
            metrics,
        }))
    }

    /// Reloads channels and prices from the store.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let count = self.registry.refresh(self.store.as_ref()).await?;
        self.prices.refresh(self.store.as_ref()).await?;
        self.cache.clear().await;
        Ok(count)
    }

    /// Starts the channel sync loop and the health monitor.
    pub fn spawn_background(self: &Arc<Self>) {
        let sync_secs = self.config.relay.channel_sync_interval_secs;
        if sync_secs > 0 {
            let runtime = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(sync_secs));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = runtime.registry.refresh(runtime.store.as_ref()).await {
                        warn!("channel sync failed: {}", e);
                    }
                    if let Err(e) = runtime.prices.refresh(runtime.store.as_ref()).await {
                        warn!("price sync failed: {}", e);
                    }
                }
            });
        }
        self.health
            .clone()
            .spawn(self.config.health.interval_secs, self.config.health.disabled_interval_secs);
    }
}
