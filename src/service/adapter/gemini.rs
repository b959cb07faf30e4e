use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};

use super::{as_i64, rewrite_model, set_header, Adapter, AdapterError, ProbeRequest};
use crate::service::ledger::Usage;
use crate::service::relay_info::{RelayFormat, RelayInfo};

pub struct GeminiAdapter;

fn gemini_usage(body: &Value) -> Option<Usage> {
    let meta = body.get("usageMetadata").filter(|u| u.is_object())?;
    let completion = as_i64(meta.get("candidatesTokenCount")) + as_i64(meta.get("thoughtsTokenCount"));
    Some(Usage {
        prompt_tokens: as_i64(meta.get("promptTokenCount")),
        completion_tokens: completion,
        cached_tokens: as_i64(meta.get("cachedContentTokenCount")),
    })
}

impl Adapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn supports(&self, format: RelayFormat) -> bool {
        format == RelayFormat::Gemini
    }

    fn request_url(&self, base_url: &str, info: &RelayInfo) -> Result<String, AdapterError> {
        let action = info.action.as_deref().unwrap_or(if info.is_stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        });
        let mut url = format!(
            "{}/v1beta/models/{}:{}",
            base_url.trim_end_matches('/'),
            info.upstream_model,
            action
        );
        if info.is_stream {
            url.push_str("?alt=sse");
        }
        Ok(url)
    }

    fn auth_headers(&self, key: &str, headers: &mut HeaderMap) -> Result<(), AdapterError> {
        set_header(headers, "x-goog-api-key", key)
    }

    /// The model lives in the URL; the body is forwarded as is.
    fn convert_request(&self, info: &RelayInfo, body: &Bytes) -> Result<Bytes, AdapterError> {
        rewrite_model(info, body, |_| {})
    }

    fn usage(&self, body: &Value) -> Option<Usage> {
        gemini_usage(body)
    }

    fn stream_usage(&self, event: &Value, usage: &mut Usage) {
        if let Some(found) = gemini_usage(event) {
            *usage = found;
        }
    }

    fn sentinel(&self, info: &RelayInfo, body: &Value) -> Option<String> {
        let generating = info.action.as_deref().is_none_or(|a| a.contains("generateContent") || a.contains("GenerateContent"));
        if !generating {
            return None;
        }
        match body.get("candidates").and_then(Value::as_array) {
            Some(candidates) if !candidates.is_empty() => None,
            _ => Some("no candidates returned".to_string()),
        }
    }

    fn probe_request(&self, _model: &str) -> Option<ProbeRequest> {
        Some(ProbeRequest {
            format: RelayFormat::Gemini,
            path: "/v1beta/models",
            body: json!({
                "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }],
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::adapter::tests::info;

    #[test]
    fn test_url_carries_model_and_action() {
        let mut info = info(RelayFormat::Gemini, "/v1beta/models", "gemini-pro", "gemini-2.5-pro", true);
        info.action = Some("streamGenerateContent".into());
        assert_eq!(
            GeminiAdapter.request_url("https://generativelanguage.googleapis.com", &info).unwrap(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn test_usage_and_sentinel() {
        let body = json!({
            "candidates": [{"content": {"parts": [{"text": "x"}]}}],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2, "thoughtsTokenCount": 3}
        });
        assert_eq!(GeminiAdapter.usage(&body), Some(Usage { prompt_tokens: 5, completion_tokens: 5, cached_tokens: 0 }));

        let info = info(RelayFormat::Gemini, "/v1beta/models", "g", "g", false);
        assert_eq!(GeminiAdapter.sentinel(&info, &body), None);
        assert_eq!(
            GeminiAdapter.sentinel(&info, &json!({"promptFeedback": {}})).as_deref(),
            Some("no candidates returned")
        );
    }
}
