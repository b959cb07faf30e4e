use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    service::{create_state_router, recent_calls::RecentCall, Runtime, StateRouter},
    utils::HttpResult,
};

use super::error::BaseError;

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    before_id: Option<u64>,
}

async fn list(
    State(runtime): State<Arc<Runtime>>,
    Query(query): Query<ListQuery>,
) -> Result<HttpResult<Vec<RecentCall>>, BaseError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    Ok(HttpResult::new(runtime.recent.list(limit, query.before_id)))
}

async fn get_one(State(runtime): State<Arc<Runtime>>, Path(id): Path<u64>) -> Result<HttpResult<RecentCall>, BaseError> {
    runtime
        .recent
        .get(id)
        .map(HttpResult::new)
        .ok_or_else(|| BaseError::NotFound(Some(format!("recent call {} not found", id))))
}

async fn metrics(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    let body = runtime
        .metrics
        .render(runtime.rate_limits.backend_down_count(), runtime.cache.metrics().errors);
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

pub fn create_recent_call_router() -> StateRouter {
    create_state_router()
        .nest(
            "/recent_call",
            create_state_router()
                .route("/list", get(list))
                .route("/{id}", get(get_one)),
        )
        .route("/metrics", get(metrics))
}
