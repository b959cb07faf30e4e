// Domain records as held by the caches and the channel registry.
// Rows from the database are converted into these once, on load.

use serde::{de, Deserialize, Serialize};
use serde_with::serde_as;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::schema::enum_def::{
    ChannelStatus, ChannelType, MultiKeyMode, TokenStatus, UserRole, UserStatus,
};

/// Represents an entry in the cache, which can either be a value (Positive)
/// or a marker indicating the value does not exist (Negative).
#[serde_as]
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub enum CacheEntry<T: Clone + Serialize + de::DeserializeOwned> {
    Positive(#[serde_as(as = "Arc<serde_with::Same>")] Arc<T>),
    Negative,
}

pub const CHANNEL_EXTRA_VERSION: u32 = 1;

/// Why a channel was taken out of rotation by the monitor or the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisableKind {
    #[default]
    Fatal,
    Throttle,
}

/// Health-check bookkeeping for an auto-disabled channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HealthState {
    pub disabled_at: i64,
    pub disabled_reason: String,
    pub retry_count: u32,
    pub last_check: i64,
    #[serde(default)]
    pub kind: DisableKind,
}

/// Typed contents of the `other_info` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelExtra {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthState>,
    /// Credential index -> reason. Disabled keys are skipped by key rotation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub disabled_keys: BTreeMap<usize, String>,
}

impl Default for ChannelExtra {
    fn default() -> Self {
        Self {
            version: CHANNEL_EXTRA_VERSION,
            health: None,
            disabled_keys: BTreeMap::new(),
        }
    }
}

impl ChannelExtra {
    /// Parses the stored column. Unknown or legacy payloads degrade to an empty extra.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => serde_json::from_str::<ChannelExtra>(s).unwrap_or_else(|e| {
                cyder_tools::log::warn!("ignoring unreadable channel other_info: {}", e);
                ChannelExtra::default()
            }),
            None => ChannelExtra::default(),
        }
    }

    pub fn to_column(&self) -> Option<String> {
        if self.health.is_none() && self.disabled_keys.is_empty() {
            None
        } else {
            serde_json::to_string(self).ok()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ModelRateLimit {
    #[serde(default)]
    pub rpm: Option<u64>,
    #[serde(default)]
    pub rpd: Option<u64>,
    #[serde(default)]
    pub tpm: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheChannel {
    pub id: i64,
    pub channel_type: ChannelType,
    pub name: String,
    pub base_url: String,
    pub keys: Vec<String>,
    pub status: ChannelStatus,
    pub priority: i64,
    pub weight: u32,
    pub models: Vec<String>,
    pub groups: Vec<String>,
    pub model_mapping: BTreeMap<String, String>,
    pub test_model: Option<String>,
    pub auto_ban: bool,
    pub rate_limit_overrides: BTreeMap<String, ModelRateLimit>,
    pub is_multi_key: bool,
    pub multi_key_mode: MultiKeyMode,
    pub tag: Option<String>,
    pub extra: ChannelExtra,
    pub used_quota: i64,
    pub response_time_ms: i64,
}

impl CacheChannel {
    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    /// Applies `model_mapping` to the requested model name.
    pub fn upstream_model(&self, model: &str) -> String {
        match self.model_mapping.get(model) {
            Some(mapped) if !mapped.is_empty() => mapped.clone(),
            _ => model.to_string(),
        }
    }

    pub fn serves(&self, group: &str, model: &str) -> bool {
        self.groups.iter().any(|g| g == group) && self.models.iter().any(|m| m == model)
    }

    /// Indices of credentials that are not individually disabled.
    pub fn usable_key_indices(&self) -> Vec<usize> {
        (0..self.keys.len())
            .filter(|i| !self.extra.disabled_keys.contains_key(i))
            .collect()
    }

    /// Model used by health probes: `test_model`, then the first served model, then the fallback.
    pub fn probe_model(&self, fallback: &str) -> String {
        self.test_model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .map(str::to_string)
            .or_else(|| self.models.first().cloned())
            .unwrap_or_else(|| fallback.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CacheToken {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub name: String,
    pub status: TokenStatus,
    pub remaining_quota: i64,
    pub unlimited_quota: bool,
    /// Unix seconds, -1 = never.
    pub expired_time: i64,
    pub model_limits_enabled: bool,
    pub model_limits: Vec<String>,
    pub allow_ips: Vec<String>,
    pub group: Option<String>,
}

impl CacheToken {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expired_time != -1 && self.expired_time < now
    }

    pub fn is_exhausted(&self) -> bool {
        !self.unlimited_quota && self.remaining_quota <= 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CacheUser {
    pub id: i64,
    pub username: String,
    pub role: UserRole,
    pub status: UserStatus,
    pub group: String,
    pub quota: i64,
    pub used_quota: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheGroup {
    pub name: String,
    pub ratio: f64,
    pub description: String,
    pub usable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheModelPrice {
    pub model_name: String,
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub cache_ratio: f64,
    /// Per-call price in display units. Set means the model is priced per call.
    pub model_price: Option<f64>,
}
