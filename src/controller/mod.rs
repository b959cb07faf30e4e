use axum::{
    extract::{ConnectInfo, Request, State},
    http,
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use cyder_tools::log::warn;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::proxy::{authenticate_request, create_relay_router};
use crate::service::{create_state_router, Runtime, StateRouter};
use channel::create_channel_router;
use recent_call::create_recent_call_router;

mod channel;
mod error;
mod recent_call;

pub use error::BaseError;

/// Admin routes take the bearer token of an admin or root user.
async fn admin_access_middleware(
    State(runtime): State<Arc<Runtime>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Result<Response, BaseError> {
    let ctx = authenticate_request(&runtime, req.headers(), &HashMap::new(), addr)
        .await
        .map_err(|e| BaseError::Unauthorized(Some(e.to_string())))?;
    if !ctx.user.role.is_admin() {
        warn!("user {} tried an admin endpoint from {}", ctx.user.id, addr);
        return Err(BaseError::Forbidden(None));
    }
    Ok(next.run(req).await)
}

pub fn create_admin_router(runtime: Arc<Runtime>) -> StateRouter {
    create_state_router().nest(
        "/api",
        create_state_router()
            .merge(create_channel_router())
            .merge(create_recent_call_router())
            .layer(middleware::from_fn_with_state(runtime, admin_access_middleware)),
    )
}

pub fn create_router(runtime: Arc<Runtime>) -> StateRouter {
    create_state_router()
        .merge(create_relay_router())
        .merge(create_admin_router(runtime))
        .fallback(handle_404)
}

pub async fn handle_404() -> impl IntoResponse {
    (http::StatusCode::NOT_FOUND, "not found")
}
