use axum::{
    body::Body,
    extract::connect_info::MockConnectInfo,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use super::SATURATED_MESSAGE;
use crate::config::{FinalConfig, GroupLimits};
use crate::controller::create_router;
use crate::schema::enum_def::{ChannelStatus, LogType, UserRole};
use crate::service::cache::types::{CacheChannel, CacheToken, CacheUser};
use crate::service::registry::tests::channel;
use crate::service::runtime::tests::{seeded_store, test_config};
use crate::service::Runtime;

const CLIENT: ([u8; 4], u16) = ([127, 0, 0, 1], 40_000);

struct FakeUpstream {
    base_url: String,
    hits: Arc<AtomicUsize>,
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Chat endpoint answering every call with `status` and `body`.
async fn fake_upstream(status: StatusCode, body: Value) -> FakeUpstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let counter = counter.clone();
            let body = body.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (status, Json(body))
            }
        }),
    );
    FakeUpstream { base_url: serve(router).await, hits }
}

fn completion() -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi there"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 7, "total_tokens": 10}
    })
}

fn upstream_channel(id: i64, priority: i64, weight: u32, base_url: &str) -> CacheChannel {
    let mut c = channel(id, priority, weight);
    c.base_url = base_url.to_string();
    c
}

async fn runtime(remaining: i64, channels: &[CacheChannel], config: FinalConfig) -> Arc<Runtime> {
    let store = seeded_store(remaining, channels).await;
    Runtime::assemble(config, store, None, None).await.unwrap()
}

fn app(runtime: &Arc<Runtime>) -> Router {
    create_router(runtime.clone())
        .with_state(runtime.clone())
        .layer(MockConnectInfo(SocketAddr::from(CLIENT)))
}

fn chat(key: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer sk-{}", key))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn chat_body(max_tokens: i64) -> Value {
    json!({"model": "m", "max_tokens": max_tokens, "messages": [{"role": "user", "content": "hello"}]})
}

fn get(path: &str, key: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("authorization", format!("Bearer {}", key))
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn remaining(runtime: &Runtime) -> i64 {
    runtime.store.get_token(10).await.unwrap().unwrap().remaining_quota
}

#[tokio::test]
async fn test_happy_path_settles_actual_usage() {
    let upstream = fake_upstream(StatusCode::OK, completion()).await;
    let runtime = runtime(10_000, &[upstream_channel(1, 100, 1, &upstream.base_url)], test_config()).await;

    let response = app(&runtime).oneshot(chat("TKEY", chat_body(16))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "hi there");

    // 3 prompt + 7 completion at completion ratio 2
    assert_eq!(remaining(&runtime).await, 9_983);
    let user = runtime.store.get_user(1).await.unwrap().unwrap();
    assert_eq!(user.quota, 1_000_000 - 17);

    let logs = runtime.store.list_logs_by_user(1, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].log_type, LogType::Consume.as_i32());
    assert_eq!(logs[0].quota, 17);
    assert_eq!(logs[0].channel_id, Some(1));
    assert_eq!((logs[0].prompt_tokens, logs[0].completion_tokens), (3, 7));

    let stats = runtime.ledger.stats();
    assert_eq!((stats.pre_consumed, stats.returned, stats.finalized), (1, 0, 1));
    assert_eq!(runtime.metrics.successes(), 1);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_on_500_moves_to_next_channel() {
    let failing = fake_upstream(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": {"message": "boom"}})).await;
    let healthy = fake_upstream(StatusCode::OK, completion()).await;
    // weight 0 on C2 keeps C1 the first pick of the tier
    let channels = [
        upstream_channel(1, 100, 1, &failing.base_url),
        upstream_channel(2, 100, 0, &healthy.base_url),
    ];
    let runtime = runtime(10_000, &channels, test_config()).await;

    let response = app(&runtime).oneshot(chat("TKEY", chat_body(16))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let calls = runtime.recent.list(10, None);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].channels, vec![1, 2]);
    assert_eq!(calls[0].channel_id, Some(2));
    assert_eq!(calls[0].attempts, 2);

    let logs = runtime.store.list_logs_by_user(1, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].channel_id, Some(2));
    assert_eq!(runtime.registry.get(1).unwrap().status, ChannelStatus::Enabled);
    assert_eq!(runtime.metrics.retries(), 1);
    assert_eq!(failing.hits.load(Ordering::SeqCst), 1);
    assert_eq!(healthy.hits.load(Ordering::SeqCst), 1);

    let stats = runtime.ledger.stats();
    assert_eq!(stats.pre_consumed, stats.returned + stats.finalized);
}

#[tokio::test]
async fn test_invalid_key_disables_channel() {
    let upstream = fake_upstream(
        StatusCode::UNAUTHORIZED,
        json!({"error": {"message": "invalid api key", "type": "invalid_request_error"}}),
    )
    .await;
    let runtime = runtime(10_000, &[upstream_channel(1, 100, 1, &upstream.base_url)], test_config()).await;

    let response = app(&runtime).oneshot(chat("TKEY", chat_body(16))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "upstream_error");
    assert!(body["error"]["message"].as_str().unwrap().starts_with("invalid api key (request id: "));

    let disabled = runtime.registry.get(1).unwrap();
    assert_eq!(disabled.status, ChannelStatus::AutoDisabled);
    assert_eq!(disabled.extra.health.as_ref().unwrap().retry_count, 0);
    let stored = runtime.store.get_channel(1).await.unwrap().unwrap();
    assert_eq!(stored.status, ChannelStatus::AutoDisabled);
    assert_eq!(remaining(&runtime).await, 10_000);

    let response = app(&runtime).oneshot(chat("TKEY", chat_body(16))).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"]["code"], "model_not_found");
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);

    let logs = runtime.store.list_logs_by_user(1, 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.log_type == LogType::Error.as_i32() && l.quota == 0));
}

#[tokio::test]
async fn test_insufficient_quota_never_reaches_upstream() {
    let upstream = fake_upstream(StatusCode::OK, completion()).await;
    let runtime = runtime(5, &[upstream_channel(1, 100, 1, &upstream.base_url)], test_config()).await;

    // estimate: 1 prompt token + 19 max tokens
    let response = app(&runtime).oneshot(chat("TKEY", chat_body(19))).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error"]["code"], "pre_consume_token_quota_failed");
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    assert_eq!(remaining(&runtime).await, 5);
    assert_eq!(runtime.ledger.stats().pre_consumed, 0);
}

#[tokio::test]
async fn test_rpm_limit_rejects_the_61st_request() {
    let upstream = fake_upstream(StatusCode::OK, completion()).await;
    let mut config = test_config();
    config.rate_limit.groups.insert(
        "g_default".to_string(),
        GroupLimits { rpm: Some(60), concurrency: Some(4), ..Default::default() },
    );
    let runtime = runtime(10_000, &[upstream_channel(1, 100, 1, &upstream.base_url)], config).await;
    let before = runtime.limiter.concurrency_in_use("g_default", 1).await;

    for _ in 0..60 {
        let response = app(&runtime).oneshot(chat("TKEY", chat_body(16))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    }
    let response = app(&runtime).oneshot(chat("TKEY", chat_body(16))).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let message = body_json(response).await["error"]["message"].as_str().unwrap().to_string();
    assert!(message.starts_with(SATURATED_MESSAGE));

    assert_eq!(upstream.hits.load(Ordering::SeqCst), 60);
    assert_eq!(runtime.limiter.concurrency_in_use("g_default", 1).await, before);
    assert_eq!(runtime.limiter.concurrency_in_use("g_default", 1).await, Some(0));
}

#[tokio::test]
async fn test_client_cancel_returns_hold_once() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let first = futures::stream::once(async {
                Ok::<_, Infallible>(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n"))
            });
            let body = Body::from_stream(first.chain(futures::stream::pending()));
            ([("content-type", "text/event-stream")], body).into_response()
        }),
    );
    let base_url = serve(router).await;
    let runtime = runtime(10_000, &[upstream_channel(1, 100, 1, &base_url)], test_config()).await;

    let mut body = chat_body(16);
    body["stream"] = json!(true);
    let response = app(&runtime).oneshot(chat("TKEY", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(remaining(&runtime).await, 10_000 - 17);

    let mut stream = response.into_body().into_data_stream();
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.starts_with(b"data: "));
    drop(stream);

    for _ in 0..100 {
        if !runtime.recent.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let calls = runtime.recent.list(10, None);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].status, 499);
    assert_eq!(calls[0].error_kind.as_deref(), Some("client_canceled"));

    let stats = runtime.ledger.stats();
    assert_eq!((stats.pre_consumed, stats.returned, stats.finalized), (1, 1, 0));
    assert_eq!(remaining(&runtime).await, 10_000);
}

#[tokio::test]
async fn test_stream_settles_after_done() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let events = concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
                "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":7}}\n\n",
                "data: [DONE]\n\n"
            );
            ([("content-type", "text/event-stream")], events).into_response()
        }),
    );
    let base_url = serve(router).await;
    let runtime = runtime(10_000, &[upstream_channel(1, 100, 1, &base_url)], test_config()).await;

    let mut body = chat_body(16);
    body["stream"] = json!(true);
    let response = app(&runtime).oneshot(chat("TKEY", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&bytes).ends_with("data: [DONE]\n\n"));

    assert_eq!(remaining(&runtime).await, 9_983);
    let stats = runtime.ledger.stats();
    assert_eq!((stats.returned, stats.finalized), (0, 1));
}

#[tokio::test]
async fn test_auth_failures_and_model_listing() {
    let runtime = runtime(10_000, &[channel(1, 100, 1)], test_config()).await;

    let response = app(&runtime).oneshot(chat("WRONG", chat_body(16))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"]["code"], "invalid_api_key");
    assert!(runtime.store.list_logs_by_user(1, 10).await.unwrap().is_empty());

    let response = app(&runtime).oneshot(get("/v1/models", "sk-TKEY")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"][0]["id"], "m");

    let response = app(&runtime).oneshot(get("/v1beta/models", "sk-TKEY")).await.unwrap();
    assert_eq!(body_json(response).await["models"][0]["name"], "models/m");

    let response = app(&runtime).oneshot(get("/v1/realtime", "sk-TKEY")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_admin_endpoints_require_admin() {
    let runtime = runtime(10_000, &[channel(1, 100, 1)], test_config()).await;
    runtime
        .store
        .insert_user(&CacheUser { id: 2, username: "u2".into(), group: "g_default".into(), quota: 100, role: UserRole::Common, ..Default::default() })
        .await
        .unwrap();
    runtime
        .store
        .insert_token(&CacheToken { id: 20, user_id: 2, key: "UKEY".into(), name: "u".into(), remaining_quota: 100, expired_time: -1, ..Default::default() })
        .await
        .unwrap();

    let response = app(&runtime).oneshot(get("/api/channel/list", "sk-UKEY")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = app(&runtime).oneshot(get("/api/channel/list", "nothing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app(&runtime).oneshot(get("/api/channel/list", "sk-TKEY")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"][0]["id"], 1);
    assert_eq!(body["data"][0]["key_count"], 1);
    assert!(body["data"][0].get("keys").is_none());

    let response = app(&runtime).oneshot(get("/api/channel/types", "sk-TKEY")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"][0]["channel_type"], "openai");
    assert_eq!(body["data"][0]["count"], 1);

    let disable = Request::builder()
        .method("POST")
        .uri("/api/channel/1/disable")
        .header("authorization", "Bearer sk-TKEY")
        .body(Body::empty())
        .unwrap();
    let response = app(&runtime).oneshot(disable).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(runtime.registry.get(1).unwrap().status, ChannelStatus::ManuallyDisabled);

    let response = app(&runtime).oneshot(get("/api/recent_call/999", "sk-TKEY")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], 1002);

    let response = app(&runtime).oneshot(get("/api/metrics", "sk-TKEY")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("relay_attempts_total"));
}
