use async_trait::async_trait;

use super::{Store, StoreError};
use crate::database::{
    channel::Channel, group::UserGroup, log::ConsumeLog, price::ModelPrice, token::Token, user::User,
    DbConnection, DbPool, DbResult,
};
use crate::schema::enum_def::{ChannelStatus, TokenStatus};
use crate::service::cache::types::{
    CacheChannel, CacheGroup, CacheModelPrice, CacheToken, CacheUser, ChannelExtra,
};

/// Diesel-backed store. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct DbStore {
    pool: DbPool,
}

impl DbStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn connect(db_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(DbPool::establish(db_url)?))
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut DbConnection) -> DbResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get_connection()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl Store for DbStore {
    async fn list_channels(&self) -> Result<Vec<CacheChannel>, StoreError> {
        let rows = self.run(Channel::list_all).await?;
        Ok(rows.into_iter().map(Channel::into_cache).collect())
    }

    async fn get_channel(&self, id: i64) -> Result<Option<CacheChannel>, StoreError> {
        let row = self.run(move |conn| Channel::get_by_id(conn, id)).await?;
        Ok(row.map(Channel::into_cache))
    }

    async fn insert_channel(&self, channel: &CacheChannel) -> Result<(), StoreError> {
        let row = Channel::from_cache(channel);
        self.run(move |conn| Channel::insert(conn, &row)).await?;
        Ok(())
    }

    async fn save_channel_status(
        &self,
        id: i64,
        status: ChannelStatus,
        extra: &ChannelExtra,
    ) -> Result<(), StoreError> {
        let other_info = extra.to_column();
        self.run(move |conn| Channel::update_status(conn, id, status.as_i32(), other_info))
            .await?;
        Ok(())
    }

    async fn save_channel_extra(&self, id: i64, extra: &ChannelExtra) -> Result<(), StoreError> {
        let other_info = extra.to_column();
        self.run(move |conn| Channel::update_other_info(conn, id, other_info)).await?;
        Ok(())
    }

    async fn save_channel_response_time(&self, id: i64, millis: i64) -> Result<(), StoreError> {
        self.run(move |conn| Channel::update_response_time(conn, id, millis)).await?;
        Ok(())
    }

    async fn add_channel_used_quota(&self, id: i64, quota: i64) -> Result<(), StoreError> {
        self.run(move |conn| Channel::add_used_quota(conn, id, quota)).await?;
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<CacheGroup>, StoreError> {
        let rows = self.run(UserGroup::list_all).await?;
        Ok(rows.into_iter().map(UserGroup::into_cache).collect())
    }

    async fn save_group(&self, group: &CacheGroup) -> Result<(), StoreError> {
        let row = UserGroup {
            name: group.name.clone(),
            ratio: group.ratio,
            description: group.description.clone(),
            usable: group.usable,
        };
        self.run(move |conn| UserGroup::upsert(conn, &row)).await?;
        Ok(())
    }

    async fn list_model_prices(&self) -> Result<Vec<CacheModelPrice>, StoreError> {
        let rows = self.run(ModelPrice::list_all).await?;
        Ok(rows.into_iter().map(ModelPrice::into_cache).collect())
    }

    async fn save_model_price(&self, price: &CacheModelPrice) -> Result<(), StoreError> {
        let row = ModelPrice {
            model_name: price.model_name.clone(),
            model_ratio: price.model_ratio,
            completion_ratio: price.completion_ratio,
            cache_ratio: price.cache_ratio,
            model_price: price.model_price,
        };
        self.run(move |conn| ModelPrice::upsert(conn, &row)).await?;
        Ok(())
    }

    async fn get_token_by_key(&self, key: &str) -> Result<Option<CacheToken>, StoreError> {
        let key = key.to_string();
        let row = self.run(move |conn| Token::get_by_key(conn, &key)).await?;
        Ok(row.map(Token::into_cache))
    }

    async fn get_token(&self, id: i64) -> Result<Option<CacheToken>, StoreError> {
        let row = self.run(move |conn| Token::get_by_id(conn, id)).await?;
        Ok(row.map(Token::into_cache))
    }

    async fn insert_token(&self, token: &CacheToken) -> Result<(), StoreError> {
        let row = Token::from_cache(token);
        self.run(move |conn| Token::insert(conn, &row)).await?;
        Ok(())
    }

    async fn update_token_status(&self, id: i64, status: TokenStatus) -> Result<(), StoreError> {
        self.run(move |conn| Token::update_status(conn, id, status.as_i32())).await?;
        Ok(())
    }

    async fn debit_token(&self, id: i64, amount: i64, checked: bool) -> Result<bool, StoreError> {
        if checked {
            self.run(move |conn| Token::decrease_quota_checked(conn, id, amount)).await
        } else {
            self.run(move |conn| Token::adjust_quota(conn, id, amount)).await?;
            Ok(true)
        }
    }

    async fn credit_token(&self, id: i64, amount: i64) -> Result<(), StoreError> {
        self.run(move |conn| Token::adjust_quota(conn, id, -amount)).await?;
        Ok(())
    }

    async fn get_user(&self, id: i64) -> Result<Option<CacheUser>, StoreError> {
        let row = self.run(move |conn| User::get_by_id(conn, id)).await?;
        Ok(row.map(User::into_cache))
    }

    async fn insert_user(&self, user: &CacheUser) -> Result<(), StoreError> {
        let row = User::from_cache(user);
        self.run(move |conn| User::insert(conn, &row)).await?;
        Ok(())
    }

    async fn debit_user(&self, id: i64, amount: i64, checked: bool) -> Result<bool, StoreError> {
        if checked {
            self.run(move |conn| User::decrease_quota_checked(conn, id, amount)).await
        } else {
            self.run(move |conn| User::adjust_quota(conn, id, amount)).await?;
            Ok(true)
        }
    }

    async fn credit_user(&self, id: i64, amount: i64) -> Result<(), StoreError> {
        self.run(move |conn| User::adjust_quota(conn, id, -amount)).await?;
        Ok(())
    }

    async fn add_user_used_quota(&self, id: i64, quota: i64) -> Result<(), StoreError> {
        self.run(move |conn| User::add_used_quota(conn, id, quota)).await?;
        Ok(())
    }

    async fn insert_log(&self, log: &ConsumeLog) -> Result<(), StoreError> {
        let row = log.clone();
        self.run(move |conn| ConsumeLog::insert(conn, &row)).await?;
        Ok(())
    }

    async fn list_logs_by_user(&self, user_id: i64, limit: i64) -> Result<Vec<ConsumeLog>, StoreError> {
        self.run(move |conn| ConsumeLog::list_by_user(conn, user_id, limit)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::enum_def::{ChannelType, MultiKeyMode, UserRole, UserStatus};
    use crate::service::cache::types::{DisableKind, HealthState};
    use std::collections::BTreeMap;

    fn open_store() -> (tempfile::TempDir, DbStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let store = DbStore::connect(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn sample_channel(id: i64) -> CacheChannel {
        let mut mapping = BTreeMap::new();
        mapping.insert("m".to_string(), "m-upstream".to_string());
        CacheChannel {
            id,
            channel_type: ChannelType::OpenAI,
            name: format!("channel-{}", id),
            base_url: "https://api.example.com".to_string(),
            keys: vec!["k1".to_string(), "k2".to_string()],
            status: ChannelStatus::Enabled,
            priority: 100,
            weight: 1,
            models: vec!["m".to_string(), "n".to_string()],
            groups: vec!["default".to_string()],
            model_mapping: mapping,
            test_model: None,
            auto_ban: true,
            rate_limit_overrides: BTreeMap::new(),
            is_multi_key: true,
            multi_key_mode: MultiKeyMode::RoundRobin,
            tag: Some("bulk".to_string()),
            extra: ChannelExtra::default(),
            used_quota: 0,
            response_time_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_channel_persistence_round_trip() {
        let (_dir, store) = open_store();
        let channel = sample_channel(7);
        store.insert_channel(&channel).await.unwrap();

        let loaded = store.get_channel(7).await.unwrap().unwrap();
        assert_eq!(loaded, channel);

        let mut extra = ChannelExtra::default();
        extra.health = Some(HealthState {
            disabled_at: 10,
            disabled_reason: "invalid api key".to_string(),
            retry_count: 0,
            last_check: 10,
            kind: DisableKind::Fatal,
        });
        store
            .save_channel_status(7, ChannelStatus::AutoDisabled, &extra)
            .await
            .unwrap();
        store.add_channel_used_quota(7, 17).await.unwrap();

        let loaded = store.get_channel(7).await.unwrap().unwrap();
        assert_eq!(loaded.status, ChannelStatus::AutoDisabled);
        assert_eq!(loaded.extra, extra);
        assert_eq!(loaded.used_quota, 17);
    }

    #[tokio::test]
    async fn test_token_checked_debit_never_goes_negative() {
        let (_dir, store) = open_store();
        let token = CacheToken {
            id: 1,
            user_id: 1,
            key: "TKEY".to_string(),
            name: "t".to_string(),
            remaining_quota: 30,
            expired_time: -1,
            ..Default::default()
        };
        store.insert_token(&token).await.unwrap();

        assert!(store.debit_token(1, 20, true).await.unwrap());
        assert!(!store.debit_token(1, 20, true).await.unwrap());
        store.credit_token(1, 20).await.unwrap();

        let loaded = store.get_token_by_key("TKEY").await.unwrap().unwrap();
        assert_eq!(loaded.remaining_quota, 30);
    }

    #[tokio::test]
    async fn test_user_quota_accounting() {
        let (_dir, store) = open_store();
        let user = CacheUser {
            id: 3,
            username: "u3".to_string(),
            role: UserRole::Common,
            status: UserStatus::Enabled,
            group: "default".to_string(),
            quota: 100,
            used_quota: 0,
        };
        store.insert_user(&user).await.unwrap();

        assert!(store.debit_user(3, 60, true).await.unwrap());
        assert!(!store.debit_user(3, 60, true).await.unwrap());
        store.add_user_used_quota(3, 60).await.unwrap();

        let loaded = store.get_user(3).await.unwrap().unwrap();
        assert_eq!(loaded.quota, 40);
        assert_eq!(loaded.used_quota, 60);
    }

    #[tokio::test]
    async fn test_default_group_is_seeded() {
        let (_dir, store) = open_store();
        let groups = store.list_groups().await.unwrap();
        assert!(groups.iter().any(|g| g.name == "default" && g.ratio == 1.0));
    }

    #[tokio::test]
    async fn test_log_insert_and_list() {
        let (_dir, store) = open_store();
        let log = ConsumeLog {
            id: 11,
            log_type: 2,
            request_id: "req-1".to_string(),
            user_id: 5,
            token_id: 1,
            quota: 17,
            other: "{}".to_string(),
            created_at: 1,
            ..Default::default()
        };
        store.insert_log(&log).await.unwrap();
        let logs = store.list_logs_by_user(5, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].quota, 17);
    }
}
