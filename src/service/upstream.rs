use bytes::Bytes;
use cyder_tools::log::{debug, error};
use flate2::read::GzDecoder;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE},
    Proxy, StatusCode,
};
use serde_json::Value;
use std::io::Read;
use std::time::Duration;

use super::adapter::Adapter;
use super::classifier::UpstreamFailure;
use super::relay_info::RelayInfo;

/// Outbound HTTP to providers, shared by the relay and the health monitor.
#[derive(Clone)]
pub struct Upstream {
    client: reqwest::Client,
    timeout: Duration,
}

pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Upstream {
    pub fn new(proxy: Option<&str>, timeout: Duration) -> Result<Self, reqwest::Error> {
        // only the configured proxy applies, never the process environment
        let builder = match proxy.filter(|p| !p.is_empty()) {
            Some(proxy_url) => reqwest::Client::builder().proxy(Proxy::all(proxy_url)?),
            None => reqwest::Client::builder().no_proxy(),
        };
        Ok(Self {
            client: builder.build()?,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends one attempt and waits for the response head. The per-attempt deadline
    /// covers connect and headers; the body is read by the caller.
    pub async fn send(
        &self,
        adapter: &dyn Adapter,
        info: &RelayInfo,
        key: &str,
        body: Bytes,
        deadline: Duration,
    ) -> Result<reqwest::Response, UpstreamFailure> {
        let channel = info
            .channel
            .as_ref()
            .ok_or_else(|| UpstreamFailure::local("no channel bound to request"))?;
        let url = adapter
            .request_url(&channel.base_url, info)
            .map_err(|e| UpstreamFailure::local(e.to_string()))?;

        let mut headers = HeaderMap::new();
        let content_type = info.content_type.as_deref().unwrap_or("application/json");
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        adapter
            .auth_headers(key, &mut headers)
            .map_err(|e| UpstreamFailure::local(e.to_string()))?;

        debug!(
            "[{}] {} {} via channel {} ({})",
            info.request_id,
            info.method,
            url,
            channel.channel_id,
            adapter.name()
        );

        let mut request = self.client.request(info.method.clone(), &url).headers(headers);
        if !body.is_empty() {
            request = request.body(body);
        }
        match tokio::time::timeout(deadline, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_timeout() => Err(UpstreamFailure::timeout(format!("upstream timed out: {}", e))),
            Ok(Err(e)) => {
                error!("[{}] upstream request to channel {} failed: {}", info.request_id, channel.channel_id, e);
                Err(UpstreamFailure::transport(format!("upstream request failed: {}", e)))
            }
            Err(_) => Err(UpstreamFailure::timeout(format!(
                "upstream did not answer within {}s",
                deadline.as_secs()
            ))),
        }
    }
}

/// Reads a whole response, undoing gzip when the upstream sent it compressed.
pub async fn read_body(response: reqwest::Response, deadline: Duration) -> Result<BufferedResponse, UpstreamFailure> {
    let status = response.status();
    let headers = response.headers().clone();
    let is_gzip = headers
        .get(CONTENT_ENCODING)
        .is_some_and(|value| value.to_str().unwrap_or("").contains("gzip"));

    let body_bytes = match tokio::time::timeout(deadline, response.bytes()).await {
        Ok(Ok(b)) => b,
        Ok(Err(e)) => return Err(UpstreamFailure::transport(format!("failed to read upstream body: {}", e))),
        Err(_) => return Err(UpstreamFailure::timeout("upstream body read timed out")),
    };

    let body = if is_gzip && !body_bytes.is_empty() {
        let mut gz = GzDecoder::new(&body_bytes[..]);
        let mut decompressed = Vec::new();
        match gz.read_to_end(&mut decompressed) {
            Ok(_) => Bytes::from(decompressed),
            Err(e) => {
                error!("Gzip decoding failed: {}", e);
                body_bytes
            }
        }
    } else {
        body_bytes
    };
    Ok(BufferedResponse { status, headers, body })
}

/// Turns a non-2xx body into a failure, reading the common vendor error shapes.
pub fn parse_error_body(status: StatusCode, body: &[u8]) -> UpstreamFailure {
    let (message, code) = match serde_json::from_slice::<Value>(body) {
        Ok(value) => error_fields(&value),
        Err(_) => (None, None),
    };
    let message = message.unwrap_or_else(|| {
        let text = String::from_utf8_lossy(body).trim().to_string();
        if text.is_empty() {
            format!("upstream returned status {}", status.as_u16())
        } else {
            text.chars().take(512).collect()
        }
    });
    UpstreamFailure::upstream(status.as_u16(), message, code)
}

fn error_fields(value: &Value) -> (Option<String>, Option<String>) {
    let as_text = |v: Option<&Value>| -> Option<String> {
        v.and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };
    match value.get("error") {
        Some(Value::String(message)) => (Some(message.clone()), as_text(value.get("code"))),
        Some(error @ Value::Object(_)) => (
            as_text(error.get("message")),
            as_text(error.get("code"))
                .or_else(|| as_text(error.get("type")))
                .or_else(|| as_text(error.get("status"))),
        ),
        _ => (as_text(value.get("message")), as_text(value.get("code"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::classifier::FailureOrigin;

    #[test]
    fn test_parse_vendor_error_shapes() {
        let openai = br#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error","code":"invalid_api_key"}}"#;
        let failure = parse_error_body(StatusCode::UNAUTHORIZED, openai);
        assert_eq!(failure.origin, FailureOrigin::Upstream);
        assert_eq!(failure.status, 401);
        assert_eq!(failure.message, "Incorrect API key provided");
        assert_eq!(failure.code.as_deref(), Some("invalid_api_key"));

        let anthropic = br#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let failure = parse_error_body(StatusCode::from_u16(529).unwrap(), anthropic);
        assert_eq!(failure.code.as_deref(), Some("overloaded_error"));

        let gemini = br#"{"error":{"code":400,"message":"API key not valid","status":"INVALID_ARGUMENT"}}"#;
        assert_eq!(parse_error_body(StatusCode::BAD_REQUEST, gemini).code.as_deref(), Some("400"));

        let plain = parse_error_body(StatusCode::BAD_GATEWAY, b"");
        assert_eq!(plain.message, "upstream returned status 502");
        assert_eq!(parse_error_body(StatusCode::BAD_GATEWAY, b"nginx").message, "nginx");
    }
}
