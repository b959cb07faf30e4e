use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{Store, StoreError};
use crate::database::log::ConsumeLog;
use crate::schema::enum_def::{ChannelStatus, TokenStatus};
use crate::service::cache::types::{
    CacheChannel, CacheGroup, CacheModelPrice, CacheToken, CacheUser, ChannelExtra,
};

#[derive(Default)]
struct Tables {
    channels: HashMap<i64, CacheChannel>,
    tokens: HashMap<i64, CacheToken>,
    users: HashMap<i64, CacheUser>,
    groups: HashMap<String, CacheGroup>,
    prices: HashMap<String, CacheModelPrice>,
    logs: Vec<ConsumeLog>,
}

/// Process-local store. Used by tests and by `db_url: memory`.
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Starts with the `default` group at ratio 1, like a freshly migrated database.
    pub fn new() -> Self {
        let mut tables = Tables::default();
        tables.groups.insert(
            "default".to_string(),
            CacheGroup {
                name: "default".to_string(),
                ratio: 1.0,
                description: "default group".to_string(),
                usable: true,
            },
        );
        Self {
            tables: Mutex::new(tables),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut guard = self
            .tables
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".to_string()))?;
        f(&mut guard)
    }

    /// Snapshot of every log row, oldest first.
    pub fn logs(&self) -> Vec<ConsumeLog> {
        self.with(|t| Ok(t.logs.clone())).unwrap_or_default()
    }
}

fn missing(what: &str, id: impl std::fmt::Display) -> StoreError {
    StoreError::NotFound(format!("{} {}", what, id))
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_channels(&self) -> Result<Vec<CacheChannel>, StoreError> {
        self.with(|t| {
            let mut channels: Vec<_> = t.channels.values().cloned().collect();
            channels.sort_by_key(|c| c.id);
            Ok(channels)
        })
    }

    async fn get_channel(&self, id: i64) -> Result<Option<CacheChannel>, StoreError> {
        self.with(|t| Ok(t.channels.get(&id).cloned()))
    }

    async fn insert_channel(&self, channel: &CacheChannel) -> Result<(), StoreError> {
        self.with(|t| {
            if t.channels.contains_key(&channel.id) {
                return Err(StoreError::Conflict(format!("channel {}", channel.id)));
            }
            t.channels.insert(channel.id, channel.clone());
            Ok(())
        })
    }

    async fn save_channel_status(
        &self,
        id: i64,
        status: ChannelStatus,
        extra: &ChannelExtra,
    ) -> Result<(), StoreError> {
        self.with(|t| {
            let channel = t.channels.get_mut(&id).ok_or_else(|| missing("channel", id))?;
            channel.status = status;
            channel.extra = extra.clone();
            Ok(())
        })
    }

    async fn save_channel_extra(&self, id: i64, extra: &ChannelExtra) -> Result<(), StoreError> {
        self.with(|t| {
            let channel = t.channels.get_mut(&id).ok_or_else(|| missing("channel", id))?;
            channel.extra = extra.clone();
            Ok(())
        })
    }

    async fn save_channel_response_time(&self, id: i64, millis: i64) -> Result<(), StoreError> {
        self.with(|t| {
            if let Some(channel) = t.channels.get_mut(&id) {
                channel.response_time_ms = millis;
            }
            Ok(())
        })
    }

    async fn add_channel_used_quota(&self, id: i64, quota: i64) -> Result<(), StoreError> {
        self.with(|t| {
            if let Some(channel) = t.channels.get_mut(&id) {
                channel.used_quota += quota;
            }
            Ok(())
        })
    }

    async fn list_groups(&self) -> Result<Vec<CacheGroup>, StoreError> {
        self.with(|t| Ok(t.groups.values().cloned().collect()))
    }

    async fn save_group(&self, group: &CacheGroup) -> Result<(), StoreError> {
        self.with(|t| {
            t.groups.insert(group.name.clone(), group.clone());
            Ok(())
        })
    }

    async fn list_model_prices(&self) -> Result<Vec<CacheModelPrice>, StoreError> {
        self.with(|t| Ok(t.prices.values().cloned().collect()))
    }

    async fn save_model_price(&self, price: &CacheModelPrice) -> Result<(), StoreError> {
        self.with(|t| {
            t.prices.insert(price.model_name.clone(), price.clone());
            Ok(())
        })
    }

    async fn get_token_by_key(&self, key: &str) -> Result<Option<CacheToken>, StoreError> {
        self.with(|t| Ok(t.tokens.values().find(|tok| tok.key == key).cloned()))
    }

    async fn get_token(&self, id: i64) -> Result<Option<CacheToken>, StoreError> {
        self.with(|t| Ok(t.tokens.get(&id).cloned()))
    }

    async fn insert_token(&self, token: &CacheToken) -> Result<(), StoreError> {
        self.with(|t| {
            if t.tokens.contains_key(&token.id) || t.tokens.values().any(|tok| tok.key == token.key) {
                return Err(StoreError::Conflict(format!("token {}", token.id)));
            }
            t.tokens.insert(token.id, token.clone());
            Ok(())
        })
    }

    async fn update_token_status(&self, id: i64, status: TokenStatus) -> Result<(), StoreError> {
        self.with(|t| {
            let token = t.tokens.get_mut(&id).ok_or_else(|| missing("token", id))?;
            token.status = status;
            Ok(())
        })
    }

    async fn debit_token(&self, id: i64, amount: i64, checked: bool) -> Result<bool, StoreError> {
        self.with(|t| {
            let token = t.tokens.get_mut(&id).ok_or_else(|| missing("token", id))?;
            if checked && token.remaining_quota < amount {
                return Ok(false);
            }
            token.remaining_quota -= amount;
            Ok(true)
        })
    }

    async fn credit_token(&self, id: i64, amount: i64) -> Result<(), StoreError> {
        self.with(|t| {
            let token = t.tokens.get_mut(&id).ok_or_else(|| missing("token", id))?;
            token.remaining_quota += amount;
            Ok(())
        })
    }

    async fn get_user(&self, id: i64) -> Result<Option<CacheUser>, StoreError> {
        self.with(|t| Ok(t.users.get(&id).cloned()))
    }

    async fn insert_user(&self, user: &CacheUser) -> Result<(), StoreError> {
        self.with(|t| {
            if t.users.contains_key(&user.id) {
                return Err(StoreError::Conflict(format!("user {}", user.id)));
            }
            t.users.insert(user.id, user.clone());
            Ok(())
        })
    }

    async fn debit_user(&self, id: i64, amount: i64, checked: bool) -> Result<bool, StoreError> {
        self.with(|t| {
            let user = t.users.get_mut(&id).ok_or_else(|| missing("user", id))?;
            if checked && user.quota < amount {
                return Ok(false);
            }
            user.quota -= amount;
            Ok(true)
        })
    }

    async fn credit_user(&self, id: i64, amount: i64) -> Result<(), StoreError> {
        self.with(|t| {
            let user = t.users.get_mut(&id).ok_or_else(|| missing("user", id))?;
            user.quota += amount;
            Ok(())
        })
    }

    async fn add_user_used_quota(&self, id: i64, quota: i64) -> Result<(), StoreError> {
        self.with(|t| {
            let user = t.users.get_mut(&id).ok_or_else(|| missing("user", id))?;
            user.used_quota += quota;
            Ok(())
        })
    }

    async fn insert_log(&self, log: &ConsumeLog) -> Result<(), StoreError> {
        self.with(|t| {
            t.logs.push(log.clone());
            Ok(())
        })
    }

    async fn list_logs_by_user(&self, user_id: i64, limit: i64) -> Result<Vec<ConsumeLog>, StoreError> {
        self.with(|t| {
            Ok(t.logs
                .iter()
                .rev()
                .filter(|l| l.user_id == user_id)
                .take(limit.max(0) as usize)
                .cloned()
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checked_debit_matches_db_semantics() {
        let store = MemoryStore::new();
        store
            .insert_token(&CacheToken {
                id: 1,
                key: "k".to_string(),
                remaining_quota: 10,
                expired_time: -1,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(store.debit_token(1, 10, true).await.unwrap());
        assert!(!store.debit_token(1, 1, true).await.unwrap());
        assert!(store.debit_token(1, 1, false).await.unwrap());
        assert_eq!(store.get_token(1).await.unwrap().unwrap().remaining_quota, -1);
    }

    #[tokio::test]
    async fn test_duplicate_token_key_conflicts() {
        let store = MemoryStore::new();
        let token = CacheToken {
            id: 1,
            key: "dup".to_string(),
            ..Default::default()
        };
        store.insert_token(&token).await.unwrap();
        let again = CacheToken { id: 2, ..token };
        assert!(matches!(store.insert_token(&again).await, Err(StoreError::Conflict(_))));
    }
}
