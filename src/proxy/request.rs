use axum::body::Body;
use axum::http::{HeaderMap, Method, Uri};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde_json::Value;

use super::error::RelayError;
use crate::service::relay_info::{estimate_prompt_tokens, requested_max_tokens, RelayFormat, RequestMeta};
use crate::utils::multipart_field;

/// Buffers the whole body so every retry can resend it. Bodies over `limit` are refused.
pub async fn read_body(body: Body, headers: &HeaderMap, limit: usize) -> Result<Bytes, RelayError> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(RelayError::BodyTooLarge(limit));
    }

    let mut stream = body.into_data_stream();
    let mut buffer = BytesMut::with_capacity(declared.unwrap_or(0).min(limit));
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| RelayError::InvalidRequest(format!("failed to read request body: {}", e)))?;
        if buffer.len() + chunk.len() > limit {
            return Err(RelayError::BodyTooLarge(limit));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// Query string without the tenant key, as it is forwarded upstream.
fn forward_query(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with("key="))
        .collect();
    (!kept.is_empty()).then(|| kept.join("&"))
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn is_multipart(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.starts_with("multipart/form-data"))
}

fn parse_json(body: &Bytes) -> Result<Value, RelayError> {
    if body.is_empty() {
        return Err(RelayError::InvalidRequest("request body is empty".to_string()));
    }
    serde_json::from_slice(body).map_err(|e| RelayError::InvalidRequest(format!("invalid json body: {}", e)))
}

fn required_model(value: Option<&str>) -> Result<String, RelayError> {
    value
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RelayError::InvalidRequest("model is required".to_string()))
}

/// `gemini-2.5-pro:streamGenerateContent` -> model and action.
fn gemini_target(path: &str) -> Result<(String, String), RelayError> {
    let segment = path
        .strip_prefix("/v1beta/models/")
        .ok_or_else(|| RelayError::InvalidRequest(format!("unsupported gemini path {}", path)))?;
    match segment.split_once(':') {
        Some((model, action)) if !model.is_empty() && !action.is_empty() => Ok((model.to_string(), action.to_string())),
        _ => Err(RelayError::InvalidRequest(format!("gemini path {} has no model action", path))),
    }
}

/// `/mj/submit/imagine` -> `mj_imagine`.
fn task_model(path: &str) -> Result<String, RelayError> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let vendor = segments.next();
    let action = segments.next_back();
    match (vendor, action) {
        (Some(vendor), Some(action)) => Ok(format!("{}_{}", vendor, action)),
        _ => Err(RelayError::InvalidRequest(format!("unsupported task path {}", path))),
    }
}

/// Extracts what routing, pricing and limits need from the inbound call.
pub fn parse_request(
    format: RelayFormat,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<RequestMeta, RelayError> {
    let path = uri.path().to_string();
    let content_type = content_type(headers);
    let query = forward_query(uri);

    let mut meta = RequestMeta::new(format, method.clone(), path);
    meta.query = query;
    meta.content_type = content_type;

    match format {
        RelayFormat::OpenAI | RelayFormat::Anthropic if is_multipart(meta.content_type.as_deref()) => {
            meta.model = required_model(multipart_field(body, "model").as_deref())?;
        }
        RelayFormat::OpenAI | RelayFormat::Anthropic => {
            let value = parse_json(body)?;
            meta.model = required_model(value.get("model").and_then(Value::as_str))?;
            meta.is_stream = value.get("stream").and_then(Value::as_bool).unwrap_or(false);
            meta.prompt_tokens = estimate_prompt_tokens(&value);
            meta.max_tokens = requested_max_tokens(&value);
        }
        RelayFormat::Gemini => {
            let (model, action) = gemini_target(&meta.path)?;
            let value = parse_json(body)?;
            meta.is_stream = action.starts_with("stream") || meta.query.as_deref().is_some_and(|q| q.contains("alt=sse"));
            meta.model = model;
            meta.action = Some(action);
            meta.prompt_tokens = estimate_prompt_tokens(&value);
            meta.max_tokens = requested_max_tokens(&value);
        }
        RelayFormat::Task => {
            meta.model = task_model(&meta.path)?;
            meta.prompt_tokens = 0;
        }
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_oversized_body_is_refused() {
        let headers = HeaderMap::new();
        let body = Body::from(vec![b'x'; 64]);
        assert!(matches!(read_body(body, &headers, 16).await, Err(RelayError::BodyTooLarge(16))));

        let mut declared = HeaderMap::new();
        declared.insert(CONTENT_LENGTH, HeaderValue::from_static("1000"));
        assert!(matches!(read_body(Body::empty(), &declared, 16).await, Err(RelayError::BodyTooLarge(16))));

        let ok = read_body(Body::from("{}"), &HeaderMap::new(), 16).await.unwrap();
        assert_eq!(&ok[..], b"{}");
    }

    #[test]
    fn test_openai_meta() {
        let uri: Uri = "/v1/chat/completions?key=TKEY&foo=bar".parse().unwrap();
        let body = Bytes::from_static(br#"{"model":"m","stream":true,"max_tokens":19,"messages":[{"role":"user","content":"hello world!"}]}"#);
        let meta = parse_request(RelayFormat::OpenAI, &Method::POST, &uri, &HeaderMap::new(), &body).unwrap();
        assert_eq!(meta.model, "m");
        assert!(meta.is_stream);
        assert_eq!(meta.prompt_tokens, 3);
        assert_eq!(meta.max_tokens, 19);
        assert_eq!(meta.query.as_deref(), Some("foo=bar"));

        let missing = Bytes::from_static(br#"{"messages":[]}"#);
        assert!(matches!(
            parse_request(RelayFormat::OpenAI, &Method::POST, &uri, &HeaderMap::new(), &missing),
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_gemini_and_task_paths() {
        let uri: Uri = "/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse".parse().unwrap();
        let body = Bytes::from_static(br#"{"contents":[{"parts":[{"text":"hi"}]}]}"#);
        let meta = parse_request(RelayFormat::Gemini, &Method::POST, &uri, &HeaderMap::new(), &body).unwrap();
        assert_eq!(meta.model, "gemini-2.5-pro");
        assert_eq!(meta.action.as_deref(), Some("streamGenerateContent"));
        assert!(meta.is_stream);

        let uri: Uri = "/mj/submit/imagine".parse().unwrap();
        let meta = parse_request(RelayFormat::Task, &Method::POST, &uri, &HeaderMap::new(), &Bytes::new()).unwrap();
        assert_eq!(meta.model, "mj_imagine");
        assert_eq!(task_model("/suno/submit/music").unwrap(), "suno_music");
    }
}
