use cyder_tools::log::{debug, warn};
use std::sync::Arc;
use strum::Display;

use super::cache::types::CacheChannel;
use super::rate_limit::RateLimitStore;
use crate::config::RateLimitConfig;

/// Which limit turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum LimitDenial {
    Concurrency,
    Rpm,
    Rpd,
    Tpm,
    Tpd,
    Burst,
}

const MINUTE_SECS: u64 = 60;

/// Request-counting limits already recorded for the request being admitted.
#[derive(Default)]
struct Taken {
    rpm: Option<String>,
    rpd: bool,
    burst: Option<String>,
}

/// A held concurrency slot. Released explicitly, or on drop as a fallback.
pub struct AdmitPermit {
    store: Arc<RateLimitStore>,
    key: Option<String>,
}

impl AdmitPermit {
    fn unlimited(store: Arc<RateLimitStore>) -> Self {
        Self { store, key: None }
    }

    pub fn holds_slot(&self) -> bool {
        self.key.is_some()
    }

    pub async fn release(mut self) {
        if let Some(key) = self.key.take() {
            self.store.concurrency_release(&key).await;
        }
    }
}

impl Drop for AdmitPermit {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let store = self.store.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        debug!("releasing concurrency slot {} on drop", key);
                        store.concurrency_release(&key).await;
                    });
                }
                Err(_) => warn!("no runtime to release concurrency slot {}", key),
            }
        }
    }
}

/// Per-group admission limits on top of the rate-limit store.
///
/// Limits are configured per group and counted per user within that group.
pub struct GroupLimiter {
    store: Arc<RateLimitStore>,
    config: RateLimitConfig,
}

impl GroupLimiter {
    pub fn new(store: Arc<RateLimitStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    fn subject(group: &str, user_id: i64) -> String {
        format!("group:{}:user:{}", group, user_id)
    }

    pub fn concurrency_key(group: &str, user_id: i64) -> String {
        format!("conc:{}", Self::subject(group, user_id))
    }

    /// Checks the read-only token budgets first, then records RPM, RPD and
    /// burst, and takes the concurrency slot last. A denial hands back every
    /// request already counted, so a denied request uses no window slot and
    /// never holds a concurrency slot.
    pub async fn admit(
        &self,
        group: &str,
        user_id: i64,
        estimated_tokens: u64,
        now_ms: i64,
    ) -> Result<AdmitPermit, LimitDenial> {
        let limits = self.config.limits_for(group);
        let subject = Self::subject(group, user_id);

        if let Some(tpm) = limits.tpm {
            if !self.store.check_tpm(&subject, tpm, estimated_tokens, now_ms).await {
                return Err(LimitDenial::Tpm);
            }
        }
        if let Some(tpd) = limits.tpd {
            if !self.store.check_tpd(&subject, tpd, estimated_tokens, now_ms).await {
                return Err(LimitDenial::Tpd);
            }
        }

        let mut taken = Taken::default();
        if let Some(rpm) = limits.rpm {
            let key = format!("rpm:{}", subject);
            if !self.store.sliding_window_allow(&key, rpm, MINUTE_SECS, now_ms).await {
                return Err(LimitDenial::Rpm);
            }
            taken.rpm = Some(key);
        }
        if let Some(rpd) = limits.rpd {
            if !self.store.daily_request_allow(&subject, rpd, now_ms).await {
                self.give_back(&subject, taken, now_ms).await;
                return Err(LimitDenial::Rpd);
            }
            taken.rpd = true;
        }
        if let Some(burst) = limits.burst {
            let key = format!("burst:{}", subject);
            let refill_per_min = limits.rpm.unwrap_or(burst);
            let refill_per_sec = refill_per_min as f64 / MINUTE_SECS as f64;
            if !self.store.token_bucket_allow(&key, burst, refill_per_sec, 1, now_ms).await {
                self.give_back(&subject, taken, now_ms).await;
                return Err(LimitDenial::Burst);
            }
            taken.burst = Some(key);
        }
        match limits.concurrency {
            Some(max) => {
                let key = Self::concurrency_key(group, user_id);
                if !self.store.concurrency_acquire(&key, max).await {
                    self.give_back(&subject, taken, now_ms).await;
                    return Err(LimitDenial::Concurrency);
                }
                Ok(AdmitPermit {
                    store: self.store.clone(),
                    key: Some(key),
                })
            }
            None => Ok(AdmitPermit::unlimited(self.store.clone())),
        }
    }

    async fn give_back(&self, subject: &str, taken: Taken, now_ms: i64) {
        if let Some(key) = taken.rpm {
            self.store.sliding_window_undo(&key, now_ms).await;
        }
        if taken.rpd {
            self.store.daily_request_undo(subject, now_ms).await;
        }
        if let Some(key) = taken.burst {
            self.store.token_bucket_refund(&key, 1).await;
        }
    }

    /// Post-request token accounting for TPM/TPD.
    pub async fn record_tokens(&self, group: &str, user_id: i64, tokens: u64, now_ms: i64) {
        self.store.record_tokens(&Self::subject(group, user_id), tokens, now_ms).await;
    }

    pub async fn concurrency_in_use(&self, group: &str, user_id: i64) -> Option<u64> {
        self.store.concurrency_current(&Self::concurrency_key(group, user_id)).await
    }

    /// Checks the channel's per-model overrides. `false` means the channel is
    /// saturated for this model right now.
    pub async fn channel_allows(&self, channel: &CacheChannel, model: &str, estimated_tokens: u64, now_ms: i64) -> bool {
        let Some(limits) = channel.rate_limit_overrides.get(model) else {
            return true;
        };
        let subject = format!("channel:{}:model:{}", channel.id, model);
        if let Some(tpm) = limits.tpm {
            if !self.store.check_tpm(&subject, tpm, estimated_tokens, now_ms).await {
                return false;
            }
        }
        let mut taken = Taken::default();
        if let Some(rpm) = limits.rpm {
            let key = format!("rpm:{}", subject);
            if !self.store.sliding_window_allow(&key, rpm, MINUTE_SECS, now_ms).await {
                return false;
            }
            taken.rpm = Some(key);
        }
        if let Some(rpd) = limits.rpd {
            if !self.store.daily_request_allow(&subject, rpd, now_ms).await {
                self.give_back(&subject, taken, now_ms).await;
                return false;
            }
        }
        true
    }

    pub async fn record_channel_tokens(&self, channel: &CacheChannel, model: &str, tokens: u64, now_ms: i64) {
        if channel.rate_limit_overrides.get(model).is_some_and(|l| l.tpm.is_some()) {
            let subject = format!("channel:{}:model:{}", channel.id, model);
            self.store.record_tokens(&subject, tokens, now_ms).await;
        }
    }
}
