use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};

use super::{as_i64, rewrite_model, set_header, Adapter, AdapterError, ProbeRequest};
use crate::service::ledger::Usage;
use crate::service::relay_info::{RelayFormat, RelayInfo};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter;

fn fold_usage(usage: &Value, into: &mut Usage) {
    let cache_read = as_i64(usage.get("cache_read_input_tokens"));
    let cache_write = as_i64(usage.get("cache_creation_input_tokens"));
    if let Some(input) = usage.get("input_tokens").and_then(Value::as_i64) {
        into.prompt_tokens = input + cache_read + cache_write;
        into.cached_tokens = cache_read;
    }
    if let Some(output) = usage.get("output_tokens").and_then(Value::as_i64) {
        into.completion_tokens = output;
    }
}

impl Adapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn supports(&self, format: RelayFormat) -> bool {
        format == RelayFormat::Anthropic
    }

    fn request_url(&self, base_url: &str, info: &RelayInfo) -> Result<String, AdapterError> {
        let base = base_url.trim_end_matches('/');
        let path = match base.ends_with("/v1") {
            true => info.request_path.strip_prefix("/v1").unwrap_or(&info.request_path),
            false => info.request_path.as_str(),
        };
        Ok(format!("{}{}", base, path))
    }

    fn auth_headers(&self, key: &str, headers: &mut HeaderMap) -> Result<(), AdapterError> {
        set_header(headers, "x-api-key", key)?;
        if !headers.contains_key("anthropic-version") {
            set_header(headers, "anthropic-version", ANTHROPIC_VERSION)?;
        }
        Ok(())
    }

    fn convert_request(&self, info: &RelayInfo, body: &Bytes) -> Result<Bytes, AdapterError> {
        rewrite_model(info, body, |_| {})
    }

    fn usage(&self, body: &Value) -> Option<Usage> {
        let usage = body.get("usage").filter(|u| u.is_object())?;
        let mut found = Usage::default();
        fold_usage(usage, &mut found);
        Some(found)
    }

    /// `message_start` carries the input side, `message_delta` the running output count.
    fn stream_usage(&self, event: &Value, usage: &mut Usage) {
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(u) = event.get("message").and_then(|m| m.get("usage")) {
                    fold_usage(u, usage);
                }
            }
            Some("message_delta") => {
                if let Some(u) = event.get("usage") {
                    fold_usage(u, usage);
                }
            }
            _ => {}
        }
    }

    fn sentinel(&self, _info: &RelayInfo, body: &Value) -> Option<String> {
        let content = body.get("content").and_then(Value::as_array)?;
        let output = body.get("usage").and_then(|u| u.get("output_tokens")).and_then(Value::as_i64);
        (content.is_empty() && output == Some(0)).then(|| "empty completion tokens".to_string())
    }

    fn probe_request(&self, model: &str) -> Option<ProbeRequest> {
        Some(ProbeRequest {
            format: RelayFormat::Anthropic,
            path: "/v1/messages",
            body: json!({
                "model": model,
                "max_tokens": 1,
                "messages": [{ "role": "user", "content": "hi" }],
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::adapter::tests::info;

    #[test]
    fn test_headers_and_url() {
        let mut headers = HeaderMap::new();
        AnthropicAdapter.auth_headers("sk-ant", &mut headers).unwrap();
        assert_eq!(headers["x-api-key"], "sk-ant");
        assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);

        let info = info(RelayFormat::Anthropic, "/v1/messages", "claude", "claude", false);
        assert_eq!(
            AnthropicAdapter.request_url("https://api.anthropic.com/v1/", &info).unwrap(),
            "https://api.anthropic.com/v1/messages"
        );
    }

    #[test]
    fn test_stream_usage_across_events() {
        let mut usage = Usage::default();
        AnthropicAdapter.stream_usage(
            &json!({"type": "message_start", "message": {"usage": {"input_tokens": 10, "cache_read_input_tokens": 4, "output_tokens": 1}}}),
            &mut usage,
        );
        AnthropicAdapter.stream_usage(&json!({"type": "content_block_delta"}), &mut usage);
        AnthropicAdapter.stream_usage(&json!({"type": "message_delta", "usage": {"output_tokens": 25}}), &mut usage);
        assert_eq!(usage, Usage { prompt_tokens: 14, completion_tokens: 25, cached_tokens: 4 });
    }
}
