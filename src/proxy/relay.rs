use axum::{
    body::Body,
    extract::Request,
    http::{request::Parts, HeaderValue},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use cyder_tools::log::{info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use super::auth::authenticate_request;
use super::error::RelayError;
use super::forward::{complete_buffered, report_failure, stream_response, InFlight};
use super::request::{parse_request, read_body};
use crate::service::adapter::adapter_for;
use crate::service::authenticator::AuthContext;
use crate::service::cache::types::CacheChannel;
use crate::service::classifier::UpstreamFailure;
use crate::service::health::auto_disable;
use crate::service::ledger::{estimate_quota, QuotaHold};
use crate::service::limiter::AdmitPermit;
use crate::service::registry::effective_group;
use crate::service::relay_info::{RelayFormat, RelayInfo, RequestMeta};
use crate::service::selector::ChannelSelector;
use crate::service::upstream::{parse_error_body, read_body as read_upstream_body};
use crate::service::Runtime;
use crate::utils::{now_ms, now_secs, ID_GENERATOR};

/// Entry point of every relayed route.
pub async fn handle_relay(
    runtime: Arc<Runtime>,
    addr: SocketAddr,
    params: HashMap<String, String>,
    request: Request<Body>,
    format: RelayFormat,
) -> Response {
    let request_id = ID_GENERATOR.generate_id().to_string();
    let mut response = match relay(&runtime, &request_id, addr, &params, request, format).await {
        Ok(response) => response,
        Err(e) => return e.with_request_id(&request_id).into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn relay(
    runtime: &Arc<Runtime>,
    request_id: &str,
    addr: SocketAddr,
    params: &HashMap<String, String>,
    request: Request<Body>,
    format: RelayFormat,
) -> Result<Response, RelayError> {
    let start_ms = now_ms();
    let (parts, body) = request.into_parts();
    let ctx = authenticate_request(runtime, &parts.headers, params, addr).await?;
    let group = effective_group(&ctx.using_group, &ctx.user.group).to_string();

    let placeholder = RequestMeta::new(format, parts.method.clone(), parts.uri.path());
    let mut info = RelayInfo::build(request_id.to_string(), &ctx, placeholder, start_ms);
    let (body, hold, permit) = match prepare(runtime, &ctx, &parts, body, &group, &mut info).await {
        Ok(prepared) => prepared,
        Err(e) => {
            report_failure(runtime, &info, &group, &[], &e).await;
            return Err(e);
        }
    };

    let flight = InFlight::new(runtime.clone(), hold, permit, info.clone(), group.clone());
    forward(runtime, flight, &ctx, info, &group, body).await
}

/// Everything before the first upstream attempt: parse, price, admit and hold quota.
async fn prepare(
    runtime: &Runtime,
    ctx: &AuthContext,
    parts: &Parts,
    body: Body,
    group: &str,
    info: &mut RelayInfo,
) -> Result<(Bytes, QuotaHold, AdmitPermit), RelayError> {
    let body = read_body(body, &parts.headers, runtime.config.relay.max_request_body_bytes).await?;
    let meta = parse_request(info.relay_format, &parts.method, &parts.uri, &parts.headers, &body)?;
    ctx.check_model(&meta.model)?;
    *info = RelayInfo::build(info.request_id.clone(), ctx, meta, info.start_ms);
    info.price = runtime.prices.price_data(&info.origin_model, group, &runtime.config.relay)?;

    let estimate = estimate_quota(
        &info.price,
        info.estimated_prompt_tokens,
        info.max_tokens,
        runtime.ledger.quota_per_unit(),
    );
    let permit = runtime
        .limiter
        .admit(group, info.user_id, estimated_tokens(info), now_ms())
        .await
        .map_err(|denial| {
            warn!("[{}] user {} hit the {} limit of group {}", info.request_id, info.user_id, denial, group);
            RelayError::RateLimited(denial)
        })?;
    match runtime.ledger.pre_consume(&ctx.user, &ctx.token, estimate).await {
        Ok(hold) => Ok((body, hold, permit)),
        Err(e) => {
            permit.release().await;
            Err(e.into())
        }
    }
}

fn estimated_tokens(info: &RelayInfo) -> u64 {
    (info.estimated_prompt_tokens + info.max_tokens).max(0) as u64
}

fn eligible(channel: &CacheChannel, format: RelayFormat) -> bool {
    adapter_for(channel.channel_type).supports(format) && !channel.usable_key_indices().is_empty()
}

/// Selection and retry loop. Every exit settles `flight`.
async fn forward(
    runtime: &Arc<Runtime>,
    mut flight: InFlight,
    ctx: &AuthContext,
    mut info: RelayInfo,
    group: &str,
    body: Bytes,
) -> Result<Response, RelayError> {
    let mut selector = ChannelSelector::new(ctx.pinned_channel_id, runtime.config.relay.retry_times);
    let deadline = runtime.upstream.timeout();
    let mut last_failure: Option<UpstreamFailure> = None;

    loop {
        let snapshot = runtime.registry.snapshot();
        let selected = {
            let mut rng = rand::rng();
            selector.select(&snapshot, group, &info.origin_model, |c| eligible(c, info.relay_format), &mut rng)
        };
        let channel = match selected {
            Ok(channel) => channel,
            Err(e) => {
                let err = match last_failure.take() {
                    Some(failure) => RelayError::Upstream(failure),
                    None => RelayError::NoChannel(e),
                };
                flight.fail(&err).await;
                return Err(err);
            }
        };

        if !runtime
            .limiter
            .channel_allows(&channel, &info.origin_model, estimated_tokens(&info), now_ms())
            .await
        {
            selector.skip(channel.id);
            continue;
        }
        let key = {
            let mut rng = rand::rng();
            runtime.registry.next_key(&channel, &mut rng)
        };
        let Some((key_index, key)) = key else {
            selector.skip(channel.id);
            continue;
        };

        let adapter = adapter_for(channel.channel_type);
        info.bind_channel(&channel, key_index);
        adapter.init(&mut info);
        if selector.attempts() > 0 {
            runtime.metrics.record_retry();
            info!(
                "[{}] retrying on channel {} after {:?}",
                info.request_id,
                channel.id,
                selector.tried()
            );
        }
        selector.record(channel.id);
        runtime.metrics.record_attempt(channel.id, &info.origin_model);
        flight.track(&info, selector.tried());

        let payload = match adapter.convert_request(&info, &body) {
            Ok(payload) => payload,
            Err(e) => {
                let err = RelayError::from(e);
                flight.fail(&err).await;
                return Err(err);
            }
        };

        let failure = match runtime.upstream.send(adapter, &info, &key, payload, deadline).await {
            Ok(response) if response.status().is_success() => {
                if info.is_stream {
                    return stream_response(flight, adapter, &info, response);
                }
                match read_upstream_body(response, deadline)
                    .await
                    .and_then(|buffered| complete_buffered(adapter, &info, buffered))
                {
                    Ok((response, usage)) => {
                        let status = response.status().as_u16();
                        flight.succeed(usage, status).await;
                        return Ok(response);
                    }
                    Err(failure) => failure,
                }
            }
            Ok(response) => match read_upstream_body(response, deadline).await {
                Ok(buffered) => parse_error_body(buffered.status, &buffered.body),
                Err(failure) => failure,
            },
            Err(failure) => failure,
        };

        let verdict = runtime.classifier.classify(&failure, channel.channel_type);
        warn!(
            "[{}] channel {} failed with status {}: {} (retry: {}, disable: {:?})",
            info.request_id, channel.id, failure.status, failure.message, verdict.retry, verdict.disable
        );
        if let Some(kind) = verdict.disable {
            if channel.auto_ban && runtime.config.relay.automatic_disable {
                auto_disable(
                    &runtime.registry,
                    runtime.store.as_ref(),
                    &runtime.metrics,
                    channel.id,
                    kind,
                    &failure.message,
                    now_secs(),
                )
                .await;
            }
        }
        if selector.should_retry(&verdict) {
            last_failure = Some(failure);
            continue;
        }
        let err = RelayError::Upstream(failure);
        flight.fail(&err).await;
        return Err(err);
    }
}

/// Realtime sessions are authenticated and then refused.
pub async fn handle_realtime(
    runtime: Arc<Runtime>,
    addr: SocketAddr,
    params: HashMap<String, String>,
    request: Request<Body>,
) -> Response {
    let request_id = ID_GENERATOR.generate_id().to_string();
    let err = match authenticate_request(&runtime, request.headers(), &params, addr).await {
        Ok(ctx) => {
            info!("[{}] user {} asked for a realtime session", request_id, ctx.user.id);
            RelayError::NotImplemented("realtime sessions are not supported".to_string())
        }
        Err(e) => e,
    };
    err.with_request_id(&request_id).into_response()
}
