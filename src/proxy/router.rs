use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Query, Request, State},
    http::HeaderMap,
    routing::{any, get, MethodRouter},
};

use crate::service::relay_info::RelayFormat;
use crate::service::{create_state_router, Runtime, StateRouter};

use super::models::{list_models, ModelListShape};
use super::relay::{handle_realtime, handle_relay};

const OPENAI_PATHS: &[&str] = &[
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/v1/images/generations",
    "/v1/images/edits",
    "/v1/audio/speech",
    "/v1/audio/transcriptions",
    "/v1/audio/translations",
    "/v1/rerank",
    "/v1/moderations",
    "/v1/responses",
];

fn relay_route(format: RelayFormat) -> MethodRouter<Arc<Runtime>> {
    any(
        move |State(runtime),
              Query(params): Query<HashMap<String, String>>,
              ConnectInfo(addr),
              request: Request<Body>| async move {
            handle_relay(runtime, addr, params, request, format).await
        },
    )
}

fn models_route(shape: ModelListShape) -> MethodRouter<Arc<Runtime>> {
    get(
        move |State(runtime),
              Query(params): Query<HashMap<String, String>>,
              ConnectInfo(addr),
              headers: HeaderMap| async move {
            list_models(runtime, addr, params, headers, shape).await
        },
    )
}

pub fn create_relay_router() -> StateRouter {
    let router = OPENAI_PATHS
        .iter()
        .fold(create_state_router(), |router, path| {
            router.route(path, relay_route(RelayFormat::OpenAI))
        });
    router
        .route("/v1/messages", relay_route(RelayFormat::Anthropic))
        .route("/v1/models", models_route(ModelListShape::OpenAI))
        .route("/v1beta/openai/models", models_route(ModelListShape::OpenAI))
        .route("/v1beta/models", models_route(ModelListShape::Gemini))
        .route("/v1beta/models/{*model_action}", relay_route(RelayFormat::Gemini))
        .route("/mj/{*task}", relay_route(RelayFormat::Task))
        .route("/suno/{*task}", relay_route(RelayFormat::Task))
        .route(
            "/v1/realtime",
            any(
                |State(runtime),
                 Query(params): Query<HashMap<String, String>>,
                 ConnectInfo(addr),
                 request: Request<Body>| async move {
                    handle_realtime(runtime, addr, params, request).await
                },
            ),
        )
}
