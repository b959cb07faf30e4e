use axum::{body::Body, http::StatusCode, response::Response};
use bytes::Bytes;
use cyder_tools::log::{debug, error, warn};
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::error::RelayError;
use crate::service::adapter::Adapter;
use crate::service::classifier::UpstreamFailure;
use crate::service::ledger::{ErrorRecord, FinalizeRecord, QuotaHold, Usage};
use crate::service::limiter::AdmitPermit;
use crate::service::metrics::OutcomeLabels;
use crate::service::recent_calls::RecentCall;
use crate::service::relay_info::RelayInfo;
use crate::service::upstream::BufferedResponse;
use crate::service::Runtime;
use crate::utils::sse::SseParser;
use crate::utils::{count_text_chars, now_ms, now_secs};

/// The quota hold and concurrency slot of one admitted request.
///
/// Settled by exactly one of [`InFlight::succeed`] or [`InFlight::fail`].
/// Dropping it unsettled means the client went away: the hold is returned
/// and the request is reported as canceled.
pub(super) struct InFlight {
    runtime: Arc<Runtime>,
    hold: Option<QuotaHold>,
    permit: Option<AdmitPermit>,
    info: RelayInfo,
    group: String,
    tried: Vec<i64>,
}

impl InFlight {
    pub fn new(runtime: Arc<Runtime>, hold: QuotaHold, permit: AdmitPermit, info: RelayInfo, group: String) -> Self {
        Self {
            runtime,
            hold: Some(hold),
            permit: Some(permit),
            info,
            group,
            tried: Vec::new(),
        }
    }

    /// Keeps the guard's view of the request in step with the current attempt.
    pub fn track(&mut self, info: &RelayInfo, tried: &[i64]) {
        self.info = info.clone();
        self.tried = tried.to_vec();
    }

    pub async fn succeed(mut self, usage: Usage, status: u16) {
        let runtime = self.runtime.clone();
        let info = &self.info;
        let now = now_ms();
        let latency_ms = info.elapsed_ms(now);
        let channel_id = info.channel_id().unwrap_or(0);

        if let Some(hold) = self.hold.take() {
            let record = FinalizeRecord {
                request_id: info.request_id.clone(),
                channel_id,
                token_name: info.token_name.clone(),
                model: info.origin_model.clone(),
                upstream_model: info.upstream_model.clone(),
                price: info.price,
                usage,
                latency_ms,
                is_stream: info.is_stream,
                group: self.group.clone(),
                attempts: self.tried.len() as u32,
            };
            if let Err(e) = runtime.ledger.finalize(hold, &record).await {
                error!("[{}] failed to settle quota: {}", info.request_id, e);
            }
        }

        let tokens = usage.total().max(0) as u64;
        runtime.limiter.record_tokens(&self.group, info.user_id, tokens, now).await;
        if let Some(channel) = runtime.registry.get(channel_id) {
            runtime
                .limiter
                .record_channel_tokens(&channel, &info.origin_model, tokens, now)
                .await;
        }

        let average = runtime.registry.record_response_time(channel_id, latency_ms as u64);
        if let Err(e) = runtime.store.save_channel_response_time(channel_id, average).await {
            warn!("failed to save response time of channel {}: {}", channel_id, e);
        }
        runtime.metrics.observe_channel_latency(channel_id, latency_ms as u64);
        runtime.metrics.record_success(
            OutcomeLabels {
                channel_id,
                model: info.origin_model.clone(),
                status,
                group: self.group.clone(),
                user_id: info.user_id,
            },
            latency_ms as u64,
        );
        runtime.recent.push(recent_call(info, &self.tried, status, latency_ms, None));

        if let Some(permit) = self.permit.take() {
            permit.release().await;
        }
    }

    pub async fn fail(mut self, err: &RelayError) {
        if let Some(hold) = self.hold.take() {
            if let Err(e) = self.runtime.ledger.return_pre_consumed(hold).await {
                error!("[{}] failed to return pre-consumed quota: {}", self.info.request_id, e);
            }
        }
        report_failure(&self.runtime, &self.info, &self.group, &self.tried, err).await;
        if let Some(permit) = self.permit.take() {
            permit.release().await;
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let Some(hold) = self.hold.take() else {
            return;
        };
        warn!("[{}] client canceled the request", self.info.request_id);
        let runtime = self.runtime.clone();
        let info = self.info.clone();
        let group = std::mem::take(&mut self.group);
        let tried = std::mem::take(&mut self.tried);
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = runtime.ledger.return_pre_consumed(hold).await {
                        error!("[{}] failed to return pre-consumed quota: {}", info.request_id, e);
                    }
                    report_failure(&runtime, &info, &group, &tried, &RelayError::ClientCanceled).await;
                    if let Some(permit) = permit {
                        permit.release().await;
                    }
                });
            }
            Err(_) => error!("[{}] no runtime to return pre-consumed quota", info.request_id),
        }
    }
}

fn recent_call(info: &RelayInfo, tried: &[i64], status: u16, latency_ms: i64, error_kind: Option<&str>) -> RecentCall {
    RecentCall {
        id: 0,
        ts: now_secs(),
        request_id: info.request_id.clone(),
        user_id: info.user_id,
        token_id: info.token_id,
        channel_id: info.channel_id(),
        model: info.origin_model.clone(),
        status,
        latency_ms,
        attempts: tried.len() as u32,
        channels: tried.to_vec(),
        error_kind: error_kind.map(str::to_string),
    }
}

/// Error log row, failure counter and recent-call entry for a request that
/// did not complete.
pub(super) async fn report_failure(runtime: &Runtime, info: &RelayInfo, group: &str, tried: &[i64], err: &RelayError) {
    let status = err.status().as_u16();
    let latency_ms = info.elapsed_ms(now_ms());
    error!(
        "[{}] relay failed ({}, status {}) for user {} model {}: {}",
        info.request_id,
        err.kind(),
        status,
        info.user_id,
        info.origin_model,
        err
    );
    let record = ErrorRecord {
        request_id: info.request_id.clone(),
        user_id: info.user_id,
        token_id: info.token_id,
        token_name: info.token_name.clone(),
        channel_id: info.channel_id(),
        model: info.origin_model.clone(),
        latency_ms,
        is_stream: info.is_stream,
        group: group.to_string(),
        status,
        message: err.to_string(),
    };
    if let Err(e) = runtime.ledger.record_error(&record).await {
        error!("[{}] failed to write error log: {}", info.request_id, e);
    }
    runtime.metrics.record_failure(OutcomeLabels {
        channel_id: info.channel_id().unwrap_or(0),
        model: info.origin_model.clone(),
        status,
        group: group.to_string(),
        user_id: info.user_id,
    });
    runtime.recent.push(recent_call(info, tried, status, latency_ms, Some(err.kind())));
}

fn copy_headers(builder: axum::http::response::Builder, headers: &HeaderMap) -> axum::http::response::Builder {
    let mut builder = builder;
    for (name, value) in headers.iter() {
        if name != CONTENT_LENGTH && name != CONTENT_ENCODING && name != TRANSFER_ENCODING {
            builder = builder.header(name, value);
        }
    }
    builder
}

/// Usage when the upstream reported none: the prompt estimate plus the
/// returned text over four.
fn estimated_usage(info: &RelayInfo, completion_chars: usize) -> Usage {
    Usage {
        prompt_tokens: info.estimated_prompt_tokens,
        completion_tokens: (completion_chars / 4) as i64,
        cached_tokens: 0,
    }
}

/// Checks a buffered 2xx body and builds the client response from it.
pub(super) fn complete_buffered(
    adapter: &dyn Adapter,
    info: &RelayInfo,
    buffered: BufferedResponse,
) -> Result<(Response, Usage), UpstreamFailure> {
    let parsed = serde_json::from_slice::<Value>(&buffered.body).ok();
    let usage = match &parsed {
        Some(value) => {
            if let Some(reason) = adapter.sentinel(info, value) {
                return Err(UpstreamFailure::sentinel(reason));
            }
            adapter
                .usage(value)
                .unwrap_or_else(|| estimated_usage(info, count_text_chars(value)))
        }
        None => estimated_usage(info, 0),
    };
    let status = StatusCode::from_u16(buffered.status.as_u16()).unwrap_or(StatusCode::OK);
    let response = copy_headers(Response::builder().status(status), &buffered.headers)
        .body(Body::from(buffered.body))
        .map_err(|e| UpstreamFailure::local(format!("failed to build response: {}", e)))?;
    Ok((response, usage))
}

/// Relays an upstream SSE stream chunk by chunk and settles the request when
/// it ends. Chunks reach the client unchanged, `[DONE]` included.
pub(super) fn stream_response(
    flight: InFlight,
    adapter: &'static dyn Adapter,
    info: &RelayInfo,
    response: reqwest::Response,
) -> Result<Response, RelayError> {
    let status = response.status().as_u16();
    let builder = copy_headers(
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK)),
        response.headers(),
    );
    let request_id = info.request_id.clone();
    let info = info.clone();

    let (tx, mut rx) = mpsc::channel::<Result<Bytes, reqwest::Error>>(10);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                chunk = stream.next() => match chunk {
                    Some(chunk) => {
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    let monitored_stream = async_stream::stream! {
        let mut flight = Some(flight);
        let mut parser = SseParser::new();
        let mut usage = Usage::default();
        let mut streamed_chars = 0usize;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                Ok(chunk) => {
                    for event in parser.process(&chunk) {
                        if event.is_done() {
                            continue;
                        }
                        if let Ok(value) = serde_json::from_str::<Value>(&event.data) {
                            adapter.stream_usage(&value, &mut usage);
                            streamed_chars += count_text_chars(&value);
                        }
                    }
                    yield Ok::<_, std::io::Error>(chunk);
                }
                Err(e) => {
                    error!("[{}] upstream stream broke: {}", info.request_id, e);
                    if let Some(flight) = flight.take() {
                        let err = RelayError::Upstream(UpstreamFailure::transport(format!("upstream stream broke: {}", e)));
                        flight.fail(&err).await;
                    }
                    yield Err(std::io::Error::other(e));
                    break;
                }
            }
        }
        if let Some(flight) = flight.take() {
            if usage.total() == 0 {
                debug!("[{}] stream carried no usage, estimating", info.request_id);
                usage = estimated_usage(&info, streamed_chars);
            }
            flight.succeed(usage, status).await;
        }
    };

    builder.body(Body::from_stream(monitored_stream)).map_err(|e| {
        error!("[{}] failed to build stream response: {}", request_id, e);
        RelayError::Local(format!("failed to build response: {}", e))
    })
}
