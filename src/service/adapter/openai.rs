use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};

use super::{as_i64, is_json, rewrite_model, set_header, Adapter, AdapterError, ProbeRequest};
use crate::service::ledger::Usage;
use crate::service::relay_info::{RelayFormat, RelayInfo};
use crate::utils::process_stream_options;

const AZURE_API_VERSION: &str = "2024-06-01";

/// OpenAI and every vendor that speaks its API unchanged.
pub struct OpenAIAdapter;

/// `{base}/v1` + `/v1/chat/completions` must not double the version segment.
fn join_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match (base.ends_with("/v1"), path.strip_prefix("/v1/")) {
        (true, Some(rest)) => format!("{}/{}", base, rest),
        _ => format!("{}{}", base, path),
    }
}

fn with_query(url: String, info: &RelayInfo) -> String {
    match info.query.as_deref().filter(|q| !q.is_empty()) {
        Some(query) if url.contains('?') => format!("{}&{}", url, query),
        Some(query) => format!("{}?{}", url, query),
        None => url,
    }
}

fn convert_openai_body(info: &RelayInfo, body: &Bytes) -> Result<Bytes, AdapterError> {
    if !is_json(info) {
        return Ok(body.clone());
    }
    let completions = info.request_path.ends_with("/completions");
    rewrite_model(info, body, |value| {
        if completions {
            process_stream_options(value);
        }
    })
}

fn openai_usage(body: &Value) -> Option<Usage> {
    let usage = body.get("usage").filter(|u| u.is_object())?;
    let prompt = usage.get("prompt_tokens").or_else(|| usage.get("input_tokens"));
    let completion = usage.get("completion_tokens").or_else(|| usage.get("output_tokens"));
    let cached = usage
        .get("prompt_tokens_details")
        .or_else(|| usage.get("input_tokens_details"))
        .and_then(|d| d.get("cached_tokens"));
    Some(Usage {
        prompt_tokens: as_i64(prompt),
        completion_tokens: as_i64(completion),
        cached_tokens: as_i64(cached),
    })
}

fn openai_sentinel(info: &RelayInfo, body: &Value) -> Option<String> {
    if !info.request_path.ends_with("/chat/completions") {
        return None;
    }
    let choices = body.get("choices").and_then(Value::as_array)?;
    let Some(first) = choices.first() else {
        return Some("no choices returned".to_string());
    };
    let message = first.get("message");
    let has_content = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty());
    let has_tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(Value::as_array)
        .is_some_and(|calls| !calls.is_empty());
    let completion_tokens = body
        .get("usage")
        .and_then(|u| u.get("completion_tokens"))
        .and_then(Value::as_i64);
    if completion_tokens == Some(0) && !has_content && !has_tool_calls {
        return Some("empty completion tokens".to_string());
    }
    None
}

fn openai_probe(model: &str) -> ProbeRequest {
    if model.contains("embedding") {
        return ProbeRequest {
            format: RelayFormat::OpenAI,
            path: "/v1/embeddings",
            body: json!({ "model": model, "input": "hi" }),
        };
    }
    ProbeRequest {
        format: RelayFormat::OpenAI,
        path: "/v1/chat/completions",
        body: json!({
            "model": model,
            "messages": [{ "role": "user", "content": "hi" }],
        }),
    }
}

impl Adapter for OpenAIAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn supports(&self, format: RelayFormat) -> bool {
        format == RelayFormat::OpenAI
    }

    fn request_url(&self, base_url: &str, info: &RelayInfo) -> Result<String, AdapterError> {
        Ok(with_query(join_path(base_url, &info.request_path), info))
    }

    fn auth_headers(&self, key: &str, headers: &mut HeaderMap) -> Result<(), AdapterError> {
        set_header(headers, "authorization", &format!("Bearer {}", key))
    }

    fn convert_request(&self, info: &RelayInfo, body: &Bytes) -> Result<Bytes, AdapterError> {
        convert_openai_body(info, body)
    }

    fn usage(&self, body: &Value) -> Option<Usage> {
        openai_usage(body)
    }

    fn stream_usage(&self, event: &Value, usage: &mut Usage) {
        if let Some(found) = openai_usage(event) {
            *usage = found;
        }
    }

    fn sentinel(&self, info: &RelayInfo, body: &Value) -> Option<String> {
        openai_sentinel(info, body)
    }

    fn probe_request(&self, model: &str) -> Option<ProbeRequest> {
        Some(openai_probe(model))
    }
}

/// Azure OpenAI: deployment-scoped URLs and an `api-key` header.
pub struct AzureAdapter;

impl Adapter for AzureAdapter {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn supports(&self, format: RelayFormat) -> bool {
        format == RelayFormat::OpenAI
    }

    fn request_url(&self, base_url: &str, info: &RelayInfo) -> Result<String, AdapterError> {
        let rest = info.request_path.strip_prefix("/v1").unwrap_or(&info.request_path);
        // deployment names cannot contain dots
        let deployment = info.upstream_model.replace('.', "");
        let url = format!(
            "{}/openai/deployments/{}{}?api-version={}",
            base_url.trim_end_matches('/'),
            deployment,
            rest,
            AZURE_API_VERSION
        );
        Ok(with_query(url, info))
    }

    fn auth_headers(&self, key: &str, headers: &mut HeaderMap) -> Result<(), AdapterError> {
        set_header(headers, "api-key", key)
    }

    fn convert_request(&self, info: &RelayInfo, body: &Bytes) -> Result<Bytes, AdapterError> {
        convert_openai_body(info, body)
    }

    fn usage(&self, body: &Value) -> Option<Usage> {
        openai_usage(body)
    }

    fn stream_usage(&self, event: &Value, usage: &mut Usage) {
        if let Some(found) = openai_usage(event) {
            *usage = found;
        }
    }

    fn sentinel(&self, info: &RelayInfo, body: &Value) -> Option<String> {
        openai_sentinel(info, body)
    }

    fn probe_request(&self, model: &str) -> Option<ProbeRequest> {
        Some(openai_probe(model))
    }
}
