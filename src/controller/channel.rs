use axum::{
    extract::{Path, State},
    routing::{get, post},
};
use cyder_tools::log::info;
use serde::Serialize;
use std::sync::Arc;

use crate::{
    schema::enum_def::{ChannelStatus, ChannelType},
    service::{
        cache::types::{CacheChannel, HealthState},
        health::{HealthReport, ProbeOutcome},
        create_state_router, Runtime, StateRouter,
    },
    utils::{now_secs, HttpResult},
};

use super::error::BaseError;

/// Channel as shown to admins. Credentials are never returned.
#[derive(Debug, Serialize)]
struct ChannelView {
    id: i64,
    name: String,
    channel_type: ChannelType,
    status: ChannelStatus,
    priority: i64,
    weight: u32,
    models: Vec<String>,
    groups: Vec<String>,
    auto_ban: bool,
    tag: Option<String>,
    key_count: usize,
    disabled_keys: usize,
    used_quota: i64,
    response_time_ms: i64,
    health: Option<HealthState>,
}

impl ChannelView {
    fn new(channel: &CacheChannel, response_time: Option<i64>) -> Self {
        Self {
            id: channel.id,
            name: channel.name.clone(),
            channel_type: channel.channel_type,
            status: channel.status,
            priority: channel.priority,
            weight: channel.weight,
            models: channel.models.clone(),
            groups: channel.groups.clone(),
            auto_ban: channel.auto_ban,
            tag: channel.tag.clone(),
            key_count: channel.keys.len(),
            disabled_keys: channel.extra.disabled_keys.len(),
            used_quota: channel.used_quota,
            response_time_ms: response_time.unwrap_or(channel.response_time_ms),
            health: channel.extra.health.clone(),
        }
    }
}

async fn list(State(runtime): State<Arc<Runtime>>) -> Result<HttpResult<Vec<ChannelView>>, BaseError> {
    let channels = runtime
        .registry
        .snapshot()
        .all()
        .iter()
        .map(|c| ChannelView::new(c, runtime.registry.response_time(c.id)))
        .collect();
    Ok(HttpResult::new(channels))
}

/// Manual status change. Enabling clears any health bookkeeping, disabling is
/// never undone by the monitor.
async fn set_status(runtime: &Runtime, id: i64, status: ChannelStatus) -> Result<HttpResult<ChannelView>, BaseError> {
    let channel = runtime
        .registry
        .get(id)
        .ok_or_else(|| BaseError::NotFound(Some(format!("channel {} not found", id))))?;
    let mut extra = channel.extra.clone();
    if status == ChannelStatus::Enabled {
        extra.health = None;
    }
    runtime.store.save_channel_status(id, status, &extra).await?;
    let updated = runtime
        .registry
        .set_status(id, status, extra)
        .ok_or_else(|| BaseError::NotFound(Some(format!("channel {} not found", id))))?;
    info!("channel {} set to {} by admin", id, status);
    Ok(HttpResult::new(ChannelView::new(&updated, runtime.registry.response_time(id))))
}

async fn enable(State(runtime): State<Arc<Runtime>>, Path(id): Path<i64>) -> Result<HttpResult<ChannelView>, BaseError> {
    set_status(&runtime, id, ChannelStatus::Enabled).await
}

async fn disable(State(runtime): State<Arc<Runtime>>, Path(id): Path<i64>) -> Result<HttpResult<ChannelView>, BaseError> {
    set_status(&runtime, id, ChannelStatus::ManuallyDisabled).await
}

async fn test_all(State(runtime): State<Arc<Runtime>>) -> Result<HttpResult<HealthReport>, BaseError> {
    let report = runtime.health.run_once(now_secs()).await?;
    Ok(HttpResult::new(report))
}

async fn test_one(State(runtime): State<Arc<Runtime>>, Path(id): Path<i64>) -> Result<HttpResult<ProbeOutcome>, BaseError> {
    let outcome = runtime.health.test_channel(id).await?;
    Ok(HttpResult::new(outcome))
}

#[derive(Debug, Serialize)]
struct TypeCount {
    channel_type: ChannelType,
    count: usize,
}

async fn type_counts(State(runtime): State<Arc<Runtime>>) -> Result<HttpResult<Vec<TypeCount>>, BaseError> {
    let counts = runtime
        .registry
        .snapshot()
        .type_counts()
        .into_iter()
        .map(|(channel_type, count)| TypeCount { channel_type, count })
        .collect();
    Ok(HttpResult::new(counts))
}

#[derive(Debug, Serialize)]
struct RefreshResult {
    channels: usize,
}

async fn refresh(State(runtime): State<Arc<Runtime>>) -> Result<HttpResult<RefreshResult>, BaseError> {
    let channels = runtime.refresh().await?;
    Ok(HttpResult::new(RefreshResult { channels }))
}

pub fn create_channel_router() -> StateRouter {
    create_state_router().nest(
        "/channel",
        create_state_router()
            .route("/list", get(list))
            .route("/types", get(type_counts))
            .route("/test", post(test_all))
            .route("/refresh", post(refresh))
            .route("/{id}/enable", post(enable))
            .route("/{id}/disable", post(disable))
            .route("/{id}/test", post(test_one)),
    )
}
