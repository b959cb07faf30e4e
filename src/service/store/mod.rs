use async_trait::async_trait;
use thiserror::Error;

use crate::database::log::ConsumeLog;
use crate::schema::enum_def::{ChannelStatus, TokenStatus};
use crate::service::cache::types::{
    CacheChannel, CacheGroup, CacheModelPrice, CacheToken, CacheUser, ChannelExtra,
};

pub mod db;
pub mod memory;

pub use db::DbStore;
pub use memory::MemoryStore;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("blocking task failed: {0}")]
    Task(String),
}

/// Persistent state consumed by the relay core.
///
/// Quota debits marked `checked` are compare-and-set: they fail (return `false`)
/// instead of taking the balance below the requested amount.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn list_channels(&self) -> Result<Vec<CacheChannel>, StoreError>;
    async fn get_channel(&self, id: i64) -> Result<Option<CacheChannel>, StoreError>;
    async fn insert_channel(&self, channel: &CacheChannel) -> Result<(), StoreError>;
    async fn save_channel_status(
        &self,
        id: i64,
        status: ChannelStatus,
        extra: &ChannelExtra,
    ) -> Result<(), StoreError>;
    async fn save_channel_extra(&self, id: i64, extra: &ChannelExtra) -> Result<(), StoreError>;
    async fn save_channel_response_time(&self, id: i64, millis: i64) -> Result<(), StoreError>;
    async fn add_channel_used_quota(&self, id: i64, quota: i64) -> Result<(), StoreError>;

    async fn list_groups(&self) -> Result<Vec<CacheGroup>, StoreError>;
    async fn save_group(&self, group: &CacheGroup) -> Result<(), StoreError>;
    async fn list_model_prices(&self) -> Result<Vec<CacheModelPrice>, StoreError>;
    async fn save_model_price(&self, price: &CacheModelPrice) -> Result<(), StoreError>;

    async fn get_token_by_key(&self, key: &str) -> Result<Option<CacheToken>, StoreError>;
    async fn get_token(&self, id: i64) -> Result<Option<CacheToken>, StoreError>;
    async fn insert_token(&self, token: &CacheToken) -> Result<(), StoreError>;
    async fn update_token_status(&self, id: i64, status: TokenStatus) -> Result<(), StoreError>;
    async fn debit_token(&self, id: i64, amount: i64, checked: bool) -> Result<bool, StoreError>;
    async fn credit_token(&self, id: i64, amount: i64) -> Result<(), StoreError>;

    async fn get_user(&self, id: i64) -> Result<Option<CacheUser>, StoreError>;
    async fn insert_user(&self, user: &CacheUser) -> Result<(), StoreError>;
    async fn debit_user(&self, id: i64, amount: i64, checked: bool) -> Result<bool, StoreError>;
    async fn credit_user(&self, id: i64, amount: i64) -> Result<(), StoreError>;
    async fn add_user_used_quota(&self, id: i64, quota: i64) -> Result<(), StoreError>;

    async fn insert_log(&self, log: &ConsumeLog) -> Result<(), StoreError>;
    async fn list_logs_by_user(&self, user_id: i64, limit: i64) -> Result<Vec<ConsumeLog>, StoreError>;
}
