use cyder_tools::log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use super::cache::types::{CacheToken, CacheUser};
use super::entity_cache::EntityCache;
use super::store::{Store, StoreError};
use crate::database::log::ConsumeLog;
use crate::schema::enum_def::LogType;
use crate::utils::{now_secs, ID_GENERATOR};

/// Price shape of one request, fixed before forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PriceData {
    pub use_price: bool,
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub cache_ratio: f64,
    pub group_ratio: f64,
    pub model_price: f64,
    pub free_model: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cached_tokens: i64,
}

impl Usage {
    pub fn total(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Quota held before forwarding.
pub fn estimate_quota(price: &PriceData, prompt_tokens: i64, max_tokens: i64, quota_per_unit: f64) -> i64 {
    if price.free_model {
        return 0;
    }
    if price.use_price {
        return (price.model_price * quota_per_unit).round() as i64;
    }
    let tokens = (prompt_tokens + max_tokens).max(0) as f64;
    (tokens * price.model_ratio * price.group_ratio).round() as i64
}

/// Canonical cost of a completed request in quota units.
pub fn compute_quota(price: &PriceData, usage: &Usage, quota_per_unit: f64) -> i64 {
    if price.use_price {
        return (price.model_price * quota_per_unit).round() as i64;
    }
    if price.model_ratio <= 0.0 || usage.total() <= 0 {
        return 0;
    }
    let cached = usage.cached_tokens.clamp(0, usage.prompt_tokens.max(0));
    let prompt = (usage.prompt_tokens - cached) + (cached as f64 * price.cache_ratio).round() as i64;
    let quota = prompt + (usage.completion_tokens as f64 * price.completion_ratio).round() as i64;
    let quota = (quota as f64 * price.model_ratio * price.group_ratio).round() as i64;
    quota.max(1)
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient token quota: need {needed}, have {available}")]
    InsufficientTokenQuota { needed: i64, available: i64 },
    #[error("insufficient user quota: need {needed}")]
    InsufficientUserQuota { needed: i64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Quota moved out of the balances for one in-flight request.
///
/// Consumed by exactly one of [`Ledger::finalize`] or [`Ledger::return_pre_consumed`].
#[derive(Debug)]
#[must_use]
pub struct QuotaHold {
    pub user_id: i64,
    pub token_id: i64,
    token_key: String,
    amount: i64,
    token_limited: bool,
}

impl QuotaHold {
    pub fn amount(&self) -> i64 {
        self.amount
    }
}

/// What a finished request reports to the ledger.
#[derive(Debug, Clone)]
pub struct FinalizeRecord {
    pub request_id: String,
    pub channel_id: i64,
    pub token_name: String,
    pub model: String,
    pub upstream_model: String,
    pub price: PriceData,
    pub usage: Usage,
    pub latency_ms: i64,
    pub is_stream: bool,
    pub group: String,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub request_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: Option<i64>,
    pub model: String,
    pub latency_ms: i64,
    pub is_stream: bool,
    pub group: String,
    pub status: u16,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LedgerStats {
    pub pre_consumed: u64,
    pub returned: u64,
    pub finalized: u64,
}

pub struct Ledger {
    store: Arc<dyn Store>,
    cache: EntityCache,
    quota_per_unit: f64,
    pre_consumed: AtomicU64,
    returned: AtomicU64,
    finalized: AtomicU64,
}

/// Debits taken by [`Ledger::pre_consume`] before the hold reaches the caller.
/// Dropped while armed, it credits them back in the background.
struct DebitRollback {
    store: Arc<dyn Store>,
    token: Option<(i64, i64)>,
    user: Option<(i64, i64)>,
}

impl DebitRollback {
    fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            token: None,
            user: None,
        }
    }

    fn disarm(&mut self) {
        self.token = None;
        self.user = None;
    }

    async fn undo(&mut self) -> Result<(), StoreError> {
        if let Some((id, amount)) = self.token.take() {
            self.store.credit_token(id, amount).await?;
        }
        if let Some((id, amount)) = self.user.take() {
            self.store.credit_user(id, amount).await?;
        }
        Ok(())
    }
}

impl Drop for DebitRollback {
    fn drop(&mut self) {
        if self.token.is_none() && self.user.is_none() {
            return;
        }
        let mut pending = DebitRollback {
            store: self.store.clone(),
            token: self.token.take(),
            user: self.user.take(),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    debug!("crediting back interrupted pre-consume");
                    if let Err(e) = pending.undo().await {
                        error!("failed to credit back interrupted pre-consume: {}", e);
                    }
                });
            }
            Err(_) => {
                pending.disarm();
                warn!("no runtime to credit back interrupted pre-consume");
            }
        }
    }
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>, cache: EntityCache, quota_per_unit: f64) -> Self {
        Self {
            store,
            cache,
            quota_per_unit,
            pre_consumed: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            finalized: AtomicU64::new(0),
        }
    }

    pub fn quota_per_unit(&self) -> f64 {
        self.quota_per_unit
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            pre_consumed: self.pre_consumed.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
        }
    }

    /// Moves `estimate` out of the token and user balances.
    ///
    /// Unlimited tokens skip the token balance but still get a hold so the
    /// release path is the same for every request.
    pub async fn pre_consume(&self, user: &CacheUser, token: &CacheToken, estimate: i64) -> Result<QuotaHold, LedgerError> {
        let amount = estimate.max(0);
        let token_limited = !token.unlimited_quota;
        let hold = QuotaHold {
            user_id: user.id,
            token_id: token.id,
            token_key: token.key.clone(),
            amount,
            token_limited,
        };
        if amount == 0 {
            self.pre_consumed.fetch_add(1, Ordering::Relaxed);
            return Ok(hold);
        }

        let mut rollback = DebitRollback::new(self.store.clone());
        if token_limited {
            if !self.store.debit_token(token.id, amount, true).await? {
                return Err(LedgerError::InsufficientTokenQuota {
                    needed: amount,
                    available: token.remaining_quota,
                });
            }
            rollback.token = Some((token.id, amount));
        }
        match self.store.debit_user(user.id, amount, true).await {
            Ok(true) => rollback.user = Some((user.id, amount)),
            other => {
                rollback.undo().await?;
                self.invalidate(&hold).await;
                other?;
                return Err(LedgerError::InsufficientUserQuota { needed: amount });
            }
        }
        self.invalidate(&hold).await;
        rollback.disarm();
        self.pre_consumed.fetch_add(1, Ordering::Relaxed);
        debug!("pre-consumed {} quota for token {}", amount, token.id);
        Ok(hold)
    }

    /// Gives the held amount back without writing a log row.
    pub async fn return_pre_consumed(&self, hold: QuotaHold) -> Result<(), LedgerError> {
        self.returned.fetch_add(1, Ordering::Relaxed);
        if hold.amount == 0 {
            return Ok(());
        }
        if hold.token_limited {
            self.store.credit_token(hold.token_id, hold.amount).await?;
        }
        self.store.credit_user(hold.user_id, hold.amount).await?;
        self.invalidate(&hold).await;
        debug!("returned {} pre-consumed quota to token {}", hold.amount, hold.token_id);
        Ok(())
    }

    /// Settles the request at its real cost and appends the consumption log row.
    /// Returns the quota charged.
    pub async fn finalize(&self, hold: QuotaHold, record: &FinalizeRecord) -> Result<i64, LedgerError> {
        let quota = compute_quota(&record.price, &record.usage, self.quota_per_unit);
        if !record.price.use_price && !record.price.free_model && record.usage.total() == 0 {
            warn!(
                "request {} on channel {} reported zero tokens for {}, not billing",
                record.request_id, record.channel_id, record.model
            );
        }

        let delta = quota - hold.amount;
        if delta > 0 {
            if hold.token_limited {
                self.store.debit_token(hold.token_id, delta, false).await?;
            }
            self.store.debit_user(hold.user_id, delta, false).await?;
        } else if delta < 0 {
            if hold.token_limited {
                self.store.credit_token(hold.token_id, -delta).await?;
            }
            self.store.credit_user(hold.user_id, -delta).await?;
        }
        if quota > 0 {
            self.store.add_user_used_quota(hold.user_id, quota).await?;
            self.store.add_channel_used_quota(record.channel_id, quota).await?;
        }

        let log = ConsumeLog {
            id: ID_GENERATOR.generate_id(),
            log_type: LogType::Consume.as_i32(),
            request_id: record.request_id.clone(),
            user_id: hold.user_id,
            token_id: hold.token_id,
            token_name: record.token_name.clone(),
            channel_id: Some(record.channel_id),
            model_name: record.model.clone(),
            prompt_tokens: record.usage.prompt_tokens,
            completion_tokens: record.usage.completion_tokens,
            quota,
            latency_ms: record.latency_ms,
            is_stream: record.is_stream,
            group_used: record.group.clone(),
            content: price_summary(&record.price),
            other: other_json(record).to_string(),
            created_at: now_secs(),
        };
        self.store.insert_log(&log).await?;
        self.invalidate(&hold).await;
        self.finalized.fetch_add(1, Ordering::Relaxed);
        info!(
            "request {} settled: {} quota (held {}) on channel {}",
            record.request_id, quota, hold.amount, record.channel_id
        );
        Ok(quota)
    }

    /// Zero-cost row for a request that failed after authentication.
    pub async fn record_error(&self, record: &ErrorRecord) -> Result<(), LedgerError> {
        let log = ConsumeLog {
            id: ID_GENERATOR.generate_id(),
            log_type: LogType::Error.as_i32(),
            request_id: record.request_id.clone(),
            user_id: record.user_id,
            token_id: record.token_id,
            token_name: record.token_name.clone(),
            channel_id: record.channel_id,
            model_name: record.model.clone(),
            prompt_tokens: 0,
            completion_tokens: 0,
            quota: 0,
            latency_ms: record.latency_ms,
            is_stream: record.is_stream,
            group_used: record.group.clone(),
            content: record.message.clone(),
            other: json!({ "status": record.status }).to_string(),
            created_at: now_secs(),
        };
        self.store.insert_log(&log).await?;
        Ok(())
    }

    async fn invalidate(&self, hold: &QuotaHold) {
        self.cache.invalidate_token(&hold.token_key).await;
        self.cache.invalidate_user(hold.user_id).await;
    }
}

fn price_summary(price: &PriceData) -> String {
    if price.use_price {
        format!("model price {:.4}", price.model_price)
    } else {
        format!(
            "model ratio {:.2}, completion ratio {:.2}, group ratio {:.2}",
            price.model_ratio, price.completion_ratio, price.group_ratio
        )
    }
}

fn other_json(record: &FinalizeRecord) -> Value {
    json!({
        "model_ratio": record.price.model_ratio,
        "completion_ratio": record.price.completion_ratio,
        "cache_ratio": record.price.cache_ratio,
        "group_ratio": record.price.group_ratio,
        "model_price": record.price.model_price,
        "use_price": record.price.use_price,
        "cached_tokens": record.usage.cached_tokens,
        "upstream_model": record.upstream_model,
        "attempts": record.attempts,
    })
}
