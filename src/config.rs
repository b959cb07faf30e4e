use std::{collections::HashMap, fs, path::Path, time::Duration};

use rand::{distr::Alphanumeric, rng, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(String, serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// --- START REDIS CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialRedisConfig {
    pub url: Option<String>,
    pub pool_size: Option<usize>,
    pub key_prefix: Option<String>,
}

impl PartialRedisConfig {
    fn merge_into(self, final_config: &mut RedisConfig) {
        if let Some(url) = self.url {
            final_config.url = url;
        }
        if let Some(pool_size) = self.pool_size {
            final_config.pool_size = pool_size;
        }
        if let Some(key_prefix) = self.key_prefix {
            final_config.key_prefix = key_prefix;
        }
    }
}

// --- START CACHE CONFIG ---

/// Backend for the token/user entity cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendType {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendType,
    #[serde(default = "default_ttl_seconds")]
    pub ttl: u64,
    #[serde(default = "default_negative_ttl_seconds")]
    pub negative_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendType::default(),
            ttl: default_ttl_seconds(),
            negative_ttl: default_negative_ttl_seconds(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl)
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialCacheConfig {
    pub backend: Option<CacheBackendType>,
    pub ttl: Option<u64>,
    pub negative_ttl: Option<u64>,
}

impl PartialCacheConfig {
    fn merge_into(self, final_config: &mut CacheConfig) {
        if let Some(backend) = self.backend {
            final_config.backend = backend;
        }
        if let Some(ttl) = self.ttl {
            final_config.ttl = ttl;
        }
        if let Some(negative_ttl) = self.negative_ttl {
            final_config.negative_ttl = negative_ttl;
        }
    }
}

// --- START RELAY CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Extra attempts after the first one.
    pub retry_times: u32,
    pub max_request_body_bytes: usize,
    pub upstream_timeout_secs: u64,
    pub quota_per_unit: f64,
    /// Ratio used for models missing from the price table. `None` rejects such models.
    pub unpriced_model_ratio: Option<f64>,
    pub automatic_disable: bool,
    pub automatic_enable: bool,
    pub auto_disable_keywords: Vec<String>,
    pub recent_call_capacity: usize,
    pub channel_sync_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_times: 3,
            max_request_body_bytes: 32 * 1024 * 1024,
            upstream_timeout_secs: 300,
            quota_per_unit: 500_000.0,
            unpriced_model_ratio: None,
            automatic_disable: true,
            automatic_enable: true,
            auto_disable_keywords: Vec::new(),
            recent_call_capacity: 256,
            channel_sync_interval_secs: 60,
        }
    }
}

impl RelayConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialRelayConfig {
    pub retry_times: Option<u32>,
    pub max_request_body_bytes: Option<usize>,
    pub upstream_timeout_secs: Option<u64>,
    pub quota_per_unit: Option<f64>,
    pub unpriced_model_ratio: Option<f64>,
    pub automatic_disable: Option<bool>,
    pub automatic_enable: Option<bool>,
    pub auto_disable_keywords: Option<Vec<String>>,
    pub recent_call_capacity: Option<usize>,
    pub channel_sync_interval_secs: Option<u64>,
}

impl PartialRelayConfig {
    fn merge_into(self, final_config: &mut RelayConfig) {
        if let Some(v) = self.retry_times {
            final_config.retry_times = v;
        }
        if let Some(v) = self.max_request_body_bytes {
            final_config.max_request_body_bytes = v;
        }
        if let Some(v) = self.upstream_timeout_secs {
            final_config.upstream_timeout_secs = v;
        }
        if let Some(v) = self.quota_per_unit {
            final_config.quota_per_unit = v;
        }
        if let Some(v) = self.unpriced_model_ratio {
            final_config.unpriced_model_ratio = Some(v);
        }
        if let Some(v) = self.automatic_disable {
            final_config.automatic_disable = v;
        }
        if let Some(v) = self.automatic_enable {
            final_config.automatic_enable = v;
        }
        if let Some(v) = self.auto_disable_keywords {
            final_config.auto_disable_keywords = v;
        }
        if let Some(v) = self.recent_call_capacity {
            final_config.recent_call_capacity = v;
        }
        if let Some(v) = self.channel_sync_interval_secs {
            final_config.channel_sync_interval_secs = v;
        }
    }
}

// --- START HEALTH CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between full monitor ticks. 0 disables the in-server monitor.
    pub interval_secs: u64,
    /// Seconds between recovery-only ticks. 0 folds recovery into the full tick.
    pub disabled_interval_secs: u64,
    pub priority_threshold: i64,
    pub cooldown_fatal_hours: u64,
    pub cooldown_throttle_minutes: u64,
    pub max_retries: u32,
    pub latency_threshold_ms: u64,
    pub probe_timeout_secs: u64,
    pub default_test_model: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 0,
            disabled_interval_secs: 0,
            priority_threshold: 0,
            cooldown_fatal_hours: 6,
            cooldown_throttle_minutes: 30,
            max_retries: 3,
            latency_threshold_ms: 30_000,
            probe_timeout_secs: 30,
            default_test_model: "gpt-4o-mini".to_string(),
        }
    }
}

impl HealthConfig {
    pub fn fatal_cooldown_secs(&self) -> i64 {
        (self.cooldown_fatal_hours * 3600) as i64
    }

    pub fn throttle_cooldown_secs(&self) -> i64 {
        (self.cooldown_throttle_minutes * 60) as i64
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialHealthConfig {
    pub interval_secs: Option<u64>,
    pub disabled_interval_secs: Option<u64>,
    pub priority_threshold: Option<i64>,
    pub cooldown_fatal_hours: Option<u64>,
    pub cooldown_throttle_minutes: Option<u64>,
    pub max_retries: Option<u32>,
    pub latency_threshold_ms: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub default_test_model: Option<String>,
}

impl PartialHealthConfig {
    pub fn merge_into(self, final_config: &mut HealthConfig) {
        if let Some(v) = self.interval_secs {
            final_config.interval_secs = v;
        }
        if let Some(v) = self.disabled_interval_secs {
            final_config.disabled_interval_secs = v;
        }
        if let Some(v) = self.priority_threshold {
            final_config.priority_threshold = v;
        }
        if let Some(v) = self.cooldown_fatal_hours {
            final_config.cooldown_fatal_hours = v;
        }
        if let Some(v) = self.cooldown_throttle_minutes {
            final_config.cooldown_throttle_minutes = v;
        }
        if let Some(v) = self.max_retries {
            final_config.max_retries = v;
        }
        if let Some(v) = self.latency_threshold_ms {
            final_config.latency_threshold_ms = v;
        }
        if let Some(v) = self.probe_timeout_secs {
            final_config.probe_timeout_secs = v;
        }
        if let Some(v) = self.default_test_model {
            final_config.default_test_model = v;
        }
    }
}

// --- START RATE LIMIT CONFIG ---

/// Per-group admission limits. `None` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GroupLimits {
    pub concurrency: Option<u64>,
    pub rpm: Option<u64>,
    pub rpd: Option<u64>,
    pub tpm: Option<u64>,
    pub tpd: Option<u64>,
    /// Short-term burst allowance, refilled at the RPM rate (or `burst` per
    /// minute when no RPM is set).
    pub burst: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub default: GroupLimits,
    #[serde(default)]
    pub groups: HashMap<String, GroupLimits>,
}

impl RateLimitConfig {
    pub fn limits_for(&self, group: &str) -> &GroupLimits {
        self.groups.get(group).unwrap_or(&self.default)
    }
}

// Default values
fn default_ttl_seconds() -> u64 {
    300
}

fn default_negative_ttl_seconds() -> u64 {
    30
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "relay:".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

// Used for deserializing user-provided config files where all fields are optional.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_url: Option<String>,
    pub session_secret: Option<String>,
    pub crypto_secret: Option<String>,
    pub proxy: Option<String>,
    pub log_level: Option<String>,
    pub timezone: Option<String>,
    pub redis: Option<PartialRedisConfig>,
    pub cache: Option<PartialCacheConfig>,
    pub relay: Option<PartialRelayConfig>,
    pub health: Option<PartialHealthConfig>,
    pub rate_limit: Option<RateLimitConfig>,
}

impl PartialConfig {
    /// Merges the fields of this partial config into a final config, overwriting existing values.
    fn merge_into(self, final_config: &mut FinalConfig) {
        if let Some(host) = self.host {
            final_config.host = host;
        }
        if let Some(port) = self.port {
            final_config.port = port;
        }
        if let Some(db_url) = self.db_url {
            final_config.db_url = db_url;
        }
        if let Some(session_secret) = self.session_secret {
            final_config.session_secret = session_secret;
        }
        if let Some(crypto_secret) = self.crypto_secret {
            final_config.crypto_secret = Some(crypto_secret);
        }
        if let Some(proxy) = self.proxy {
            final_config.proxy = Some(proxy);
        }
        if let Some(log_level) = self.log_level {
            final_config.log_level = log_level;
        }
        if let Some(timezone) = self.timezone {
            final_config.timezone = Some(timezone);
        }
        if let Some(redis) = self.redis {
            redis.merge_into(final_config.redis.get_or_insert_with(Default::default));
        }
        if let Some(cache) = self.cache {
            cache.merge_into(&mut final_config.cache)
        }
        if let Some(relay) = self.relay {
            relay.merge_into(&mut final_config.relay)
        }
        if let Some(health) = self.health {
            health.merge_into(&mut final_config.health)
        }
        if let Some(rate_limit) = self.rate_limit {
            final_config.rate_limit = rate_limit;
        }
    }
}

// The fully resolved configuration used by the application.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FinalConfig {
    pub host: String,
    pub port: u16,
    pub db_url: String,
    pub session_secret: String,
    pub crypto_secret: Option<String>,
    pub proxy: Option<String>,
    pub log_level: String,
    pub timezone: Option<String>,
    pub redis: Option<RedisConfig>,
    pub cache: CacheConfig,
    pub relay: RelayConfig,
    pub health: HealthConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for FinalConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            db_url: "./storage/relay.db".to_string(),
            session_secret: generate_random_string(48),
            crypto_secret: None,
            proxy: None,
            log_level: "info".to_string(),
            timezone: None,
            redis: None,
            cache: CacheConfig::default(),
            relay: RelayConfig::default(),
            health: HealthConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl FinalConfig {
    /// Loads defaults, then the yaml file (explicit path or `config.yaml` when present), then env.
    pub fn load(path: Option<&Path>) -> Result<FinalConfig, ConfigError> {
        let default_path = Path::new("config.yaml");
        let file_contents = match path {
            Some(p) => Some(read_config_file(p)?),
            None if default_path.exists() => Some(read_config_file(default_path)?),
            None => None,
        };
        Self::from_sources(file_contents.as_deref(), |key| std::env::var(key).ok())
    }

    pub fn from_sources<F>(file_contents: Option<&str>, env: F) -> Result<FinalConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut final_config = FinalConfig::default();

        if let Some(contents) = file_contents {
            let user_config: PartialConfig = serde_yaml::from_str(contents)
                .map_err(|e| ConfigError::Parse("config".to_string(), e))?;
            user_config.merge_into(&mut final_config);
        }

        // Environment variables have the highest priority.
        get_config_from_env(&env).merge_into(&mut final_config);

        if final_config.redis.is_none() && final_config.cache.backend == CacheBackendType::Redis {
            final_config.cache.backend = CacheBackendType::Memory;
        }
        if final_config.relay.quota_per_unit <= 0.0 {
            return Err(ConfigError::Invalid("relay.quota_per_unit must be positive".to_string()));
        }
        if let Some(tz) = &final_config.timezone {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                return Err(ConfigError::Invalid(format!("unknown timezone '{}'", tz)));
            }
        }

        Ok(final_config)
    }

    /// Secret used to salt token cache keys. Falls back to the session secret.
    pub fn crypto_secret(&self) -> &str {
        self.crypto_secret.as_deref().unwrap_or(&self.session_secret)
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.timezone
            .as_deref()
            .and_then(|tz| tz.parse().ok())
            .unwrap_or(chrono_tz::UTC)
    }
}

fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|e| ConfigError::Io(path.display().to_string(), e))
}

fn generate_random_string(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn get_env_var<T: std::str::FromStr, F: Fn(&str) -> Option<String>>(env: &F, key: &str) -> Option<T> {
    env(key).and_then(|v| v.trim().parse().ok())
}

fn get_config_from_env<F: Fn(&str) -> Option<String>>(env: &F) -> PartialConfig {
    let redis = get_env_var::<String, _>(env, "REDIS_CONN_STRING").map(|url| PartialRedisConfig {
        url: Some(url),
        ..Default::default()
    });
    let cache = match get_env_var::<bool, _>(env, "MEMORY_CACHE_ENABLED") {
        Some(true) => Some(PartialCacheConfig {
            backend: Some(CacheBackendType::Memory),
            ..Default::default()
        }),
        _ => None,
    };
    let retry_times = get_env_var(env, "RETRY_TIMES");
    let relay = retry_times.map(|retry_times| PartialRelayConfig {
        retry_times: Some(retry_times),
        ..Default::default()
    });
    let test_minutes: Option<u64> = get_env_var(env, "CHANNEL_TEST_FREQUENCY");
    let disabled_minutes: Option<u64> = get_env_var(env, "CHANNEL_TEST_DISABLED_FREQUENCY");
    let health = if test_minutes.is_some() || disabled_minutes.is_some() {
        Some(PartialHealthConfig {
            interval_secs: test_minutes.map(|m| m * 60),
            disabled_interval_secs: disabled_minutes.map(|m| m * 60),
            ..Default::default()
        })
    } else {
        None
    };

    PartialConfig {
        host: get_env_var(env, "HOST"),
        port: get_env_var(env, "PORT"),
        db_url: get_env_var(env, "SQL_DSN").or_else(|| get_env_var(env, "DB_URL")),
        session_secret: get_env_var(env, "SESSION_SECRET"),
        crypto_secret: get_env_var(env, "CRYPTO_SECRET"),
        proxy: get_env_var(env, "PROXY"),
        log_level: get_env_var(env, "LOG_LEVEL"),
        timezone: get_env_var(env, "TIMEZONE"),
        redis,
        cache,
        relay,
        health,
        rate_limit: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = FinalConfig::from_sources(None, env_from(&[])).unwrap();
        assert_eq!(config.relay.retry_times, 3);
        assert_eq!(config.relay.quota_per_unit, 500_000.0);
        assert_eq!(config.health.cooldown_fatal_hours, 6);
        assert!(config.redis.is_none());
        assert_eq!(config.crypto_secret(), config.session_secret);
    }

    #[test]
    fn test_yaml_then_env_override() {
        let yaml = r#"
port: 8080
db_url: "/tmp/a.db"
relay:
  retry_times: 5
health:
  max_retries: 7
rate_limit:
  groups:
    vip:
      rpm: 600
      burst: 20
"#;
        let env = env_from(&[
            ("SQL_DSN", "postgres://u:p@localhost/relay"),
            ("RETRY_TIMES", "1"),
            ("CHANNEL_TEST_FREQUENCY", "10"),
            ("CRYPTO_SECRET", "pepper"),
        ]);
        let config = FinalConfig::from_sources(Some(yaml), env).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.db_url, "postgres://u:p@localhost/relay");
        assert_eq!(config.relay.retry_times, 1);
        assert_eq!(config.health.max_retries, 7);
        assert_eq!(config.health.interval_secs, 600);
        assert_eq!(config.crypto_secret(), "pepper");
        assert_eq!(config.rate_limit.limits_for("vip").rpm, Some(600));
        assert_eq!(config.rate_limit.limits_for("vip").burst, Some(20));
        assert_eq!(config.rate_limit.limits_for("other").rpm, None);
    }

    #[test]
    fn test_redis_cache_falls_back_to_memory_without_redis() {
        let yaml = "cache:\n  backend: redis\n";
        let config = FinalConfig::from_sources(Some(yaml), env_from(&[])).unwrap();
        assert_eq!(config.cache.backend, CacheBackendType::Memory);

        let config = FinalConfig::from_sources(
            Some(yaml),
            env_from(&[("REDIS_CONN_STRING", "redis://localhost:6380/")]),
        )
        .unwrap();
        assert_eq!(config.cache.backend, CacheBackendType::Redis);
        assert_eq!(config.redis.unwrap().url, "redis://localhost:6380/");
    }

    #[test]
    fn test_memory_cache_enabled_env() {
        let yaml = "redis:\n  url: redis://r/\ncache:\n  backend: redis\n";
        let config =
            FinalConfig::from_sources(Some(yaml), env_from(&[("MEMORY_CACHE_ENABLED", "true")])).unwrap();
        assert_eq!(config.cache.backend, CacheBackendType::Memory);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = FinalConfig::from_sources(Some("no_such_field: 1\n"), env_from(&[]));
        assert!(matches!(result, Err(ConfigError::Parse(_, _))));
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let result = FinalConfig::from_sources(Some("timezone: Mars/Olympus\n"), env_from(&[]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
