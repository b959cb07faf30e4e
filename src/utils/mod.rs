use axum::{
    response::{IntoResponse, Response},
    Json,
};
use cyder_tools::snow_flake::Snowflake;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::LazyLock;

pub mod sse;

#[derive(Debug, Serialize)]
pub struct HttpResult<T> {
    pub code: usize,
    pub data: T,
}

impl<T> HttpResult<T> {
    pub fn new(data: T) -> HttpResult<T> {
        HttpResult { code: 0, data }
    }
}

impl<T> IntoResponse for HttpResult<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

pub static ID_GENERATOR: LazyLock<Snowflake> = LazyLock::new(|| Snowflake::new(1));

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Forces `stream_options.include_usage` on streaming OpenAI-style bodies so the
/// final chunk carries token counts.
pub fn process_stream_options(data: &mut Value) {
    let is_stream = data.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if !is_stream {
        return;
    }
    match data.get_mut("stream_options") {
        Some(Value::Object(options)) => {
            options.insert("include_usage".to_string(), Value::Bool(true));
        }
        _ => data["stream_options"] = json!({ "include_usage": true }),
    }
}

const TEXT_KEYS: &[&str] = &["content", "text", "prompt", "input", "system", "instructions", "query"];

/// Characters of user-visible text in a JSON payload, used for token estimates.
pub fn count_text_chars(value: &Value) -> usize {
    fn walk(value: &Value, counted: bool) -> usize {
        match value {
            Value::String(s) if counted => s.chars().count(),
            Value::Array(items) => items.iter().map(|v| walk(v, counted)).sum(),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| walk(v, counted || TEXT_KEYS.contains(&k.as_str())))
                .sum(),
            _ => 0,
        }
    }
    walk(value, false)
}

/// Value of a plain text field in a `multipart/form-data` body.
pub fn multipart_field(body: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let marker = format!("name=\"{}\"", name);
    let start = text.find(&marker)? + marker.len();
    let rest = &text[start..];
    let value_start = rest.find("\r\n\r\n").map(|p| p + 4)?;
    let value = &rest[value_start..];
    let end = value.find("\r\n").unwrap_or(value.len());
    let trimmed = value[..end].trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_options_forced_on_stream() {
        let mut body = json!({"model": "m", "stream": true});
        process_stream_options(&mut body);
        assert_eq!(body["stream_options"]["include_usage"], true);

        let mut body = json!({"stream": true, "stream_options": {"include_usage": false}});
        process_stream_options(&mut body);
        assert_eq!(body["stream_options"]["include_usage"], true);

        let mut body = json!({"stream": false});
        process_stream_options(&mut body);
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_count_text_chars() {
        let body = json!({
            "model": "ignored-model-name",
            "messages": [
                {"role": "system", "content": "abcd"},
                {"role": "user", "content": [{"type": "text", "text": "hi"}]}
            ]
        });
        assert_eq!(count_text_chars(&body), 6);
    }

    #[test]
    fn test_multipart_field() {
        let body = b"--b\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-1\r\n--b\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.wav\"\r\n\r\nRIFF\r\n--b--\r\n";
        assert_eq!(multipart_field(body, "model").as_deref(), Some("whisper-1"));
        assert_eq!(multipart_field(body, "language"), None);
    }
}
