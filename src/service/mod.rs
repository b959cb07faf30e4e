pub mod adapter;
pub mod authenticator;
pub mod cache;
pub mod classifier;
pub mod entity_cache;
pub mod health;
pub mod ledger;
pub mod limiter;
pub mod metrics;
pub mod pricing;
pub mod rate_limit;
pub mod recent_calls;
pub mod redis;
pub mod registry;
pub mod relay_info;
pub mod runtime;
pub mod selector;
pub mod store;
pub mod upstream;

pub use runtime::Runtime;

use axum::Router;
use std::sync::Arc;

pub type StateRouter = Router<Arc<Runtime>>;

pub fn create_state_router() -> StateRouter {
    Router::<Arc<Runtime>>::new()
}
