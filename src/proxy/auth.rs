use std::collections::HashMap;
use std::net::SocketAddr;

use axum::http::HeaderMap;
use cyder_tools::log::{debug, warn};
use reqwest::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};

use super::error::RelayError;
use crate::service::authenticator::{AuthContext, AuthError};
use crate::service::Runtime;
use crate::utils::now_secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKeyPosition {
    AuthorizationHeader,
    XApiKeyHeader,
    XGoogApiKeyHeader,
    KeyQuery,
    MjApiSecretHeader,
    WebsocketProtocol,
}

const REALTIME_KEY_PROTOCOL: &str = "openai-insecure-api-key.";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn strip_key_prefix(raw: &str) -> &str {
    let raw = raw.trim();
    let raw = match raw.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ if raw.eq_ignore_ascii_case("bearer") => "",
        _ => raw,
    };
    raw.strip_prefix("sk-").unwrap_or(raw)
}

/// Finds the tenant key wherever the client's SDK put it.
pub fn parse_token_from_request(
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Option<(String, ApiKeyPosition)> {
    let found = if let Some(value) = header_str(headers, AUTHORIZATION.as_str()) {
        (value, ApiKeyPosition::AuthorizationHeader)
    } else if let Some(value) = header_str(headers, "x-api-key") {
        (value, ApiKeyPosition::XApiKeyHeader)
    } else if let Some(value) = header_str(headers, "x-goog-api-key") {
        (value, ApiKeyPosition::XGoogApiKeyHeader)
    } else if let Some(value) = params.get("key").map(|k| k.trim()).filter(|k| !k.is_empty()) {
        (value, ApiKeyPosition::KeyQuery)
    } else if let Some(value) = header_str(headers, "mj-api-secret") {
        (value, ApiKeyPosition::MjApiSecretHeader)
    } else {
        let protocols = header_str(headers, SEC_WEBSOCKET_PROTOCOL.as_str())?;
        let value = protocols
            .split(',')
            .map(str::trim)
            .find_map(|p| p.strip_prefix(REALTIME_KEY_PROTOCOL))?;
        (value, ApiKeyPosition::WebsocketProtocol)
    };
    let key = strip_key_prefix(found.0);
    (!key.is_empty()).then(|| (key.to_string(), found.1))
}

pub async fn authenticate_request(
    runtime: &Runtime,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
    addr: SocketAddr,
) -> Result<AuthContext, RelayError> {
    let Some((key, position)) = parse_token_from_request(headers, params) else {
        warn!("request from {} carries no api key", addr);
        return Err(AuthError::MissingKey.into());
    };
    debug!("authenticating key from {:?}", position);
    runtime
        .authenticator
        .authenticate(&key, Some(addr.ip()), now_secs())
        .await
        .map_err(|e| {
            warn!("authentication failed for {}: {}", addr, e);
            RelayError::Auth(e)
        })
}
