use axum::{
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use super::auth::authenticate_request;
use crate::service::authenticator::AuthContext;
use crate::service::registry::effective_group;
use crate::service::Runtime;
use crate::utils::ID_GENERATOR;

#[derive(Debug, Serialize)]
struct OpenAIModel {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: &'static str,
}

#[derive(Debug, Serialize)]
struct OpenAIModelList {
    object: &'static str,
    data: Vec<OpenAIModel>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiModel {
    name: String,
    display_name: String,
    supported_generation_methods: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct GeminiModelList {
    models: Vec<GeminiModel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelListShape {
    OpenAI,
    Gemini,
}

/// Models routable in the caller's group, narrowed by the token's model limits.
fn visible_models(runtime: &Runtime, ctx: &AuthContext) -> Vec<String> {
    let group = effective_group(&ctx.using_group, &ctx.user.group);
    let mut models = runtime.registry.snapshot().models_for_group(group);
    if let Some(allowed) = ctx.token_model_limits() {
        models.retain(|m| allowed.contains(m));
    }
    models
}

pub async fn list_models(
    runtime: Arc<Runtime>,
    addr: SocketAddr,
    params: HashMap<String, String>,
    headers: HeaderMap,
    shape: ModelListShape,
) -> Response {
    let ctx = match authenticate_request(&runtime, &headers, &params, addr).await {
        Ok(ctx) => ctx,
        Err(e) => return e.with_request_id(&ID_GENERATOR.generate_id().to_string()).into_response(),
    };
    let models = visible_models(&runtime, &ctx);
    match shape {
        ModelListShape::OpenAI => Json(OpenAIModelList {
            object: "list",
            data: models
                .into_iter()
                .map(|id| OpenAIModel { id, object: "model", created: 0, owned_by: "relay" })
                .collect(),
        })
        .into_response(),
        ModelListShape::Gemini => Json(GeminiModelList {
            models: models
                .into_iter()
                .map(|id| GeminiModel {
                    name: format!("models/{}", id),
                    display_name: id,
                    supported_generation_methods: vec!["generateContent", "streamGenerateContent"],
                })
                .collect(),
        })
        .into_response(),
    }
}
