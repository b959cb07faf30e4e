use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use thiserror::Error;

use super::ledger::Usage;
use super::relay_info::{RelayFormat, RelayInfo};
use crate::schema::enum_def::ChannelType;

mod anthropic;
mod gemini;
mod openai;
mod passthrough;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai::{AzureAdapter, OpenAIAdapter};
pub use passthrough::PassthroughAdapter;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdapterError {
    #[error("request body is not valid json: {0}")]
    InvalidBody(String),
    #[error("invalid header value for {0}")]
    InvalidHeader(&'static str),
    #[error("{0}")]
    Unsupported(String),
}

/// A minimal request used by health probes.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub format: RelayFormat,
    pub path: &'static str,
    pub body: Value,
}

/// Provider-specific half of a relay attempt.
///
/// The core owns selection, retry and billing; an adapter only knows how to
/// address, authenticate and read one vendor's API.
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inbound dialects this provider can serve without translation.
    fn supports(&self, format: RelayFormat) -> bool;

    /// Last chance to adjust the info once a channel is bound.
    fn init(&self, _info: &mut RelayInfo) {}

    fn request_url(&self, base_url: &str, info: &RelayInfo) -> Result<String, AdapterError>;

    fn auth_headers(&self, key: &str, headers: &mut HeaderMap) -> Result<(), AdapterError>;

    /// Produces the upstream payload from the buffered inbound body.
    fn convert_request(&self, info: &RelayInfo, body: &Bytes) -> Result<Bytes, AdapterError>;

    /// Usage of a buffered 2xx response. `None` when the body carries none.
    fn usage(&self, body: &Value) -> Option<Usage>;

    /// Folds one parsed stream event into `usage`.
    fn stream_usage(&self, event: &Value, usage: &mut Usage);

    /// A 2xx body that should be treated as a failed attempt.
    fn sentinel(&self, _info: &RelayInfo, _body: &Value) -> Option<String> {
        None
    }

    fn probe_request(&self, model: &str) -> Option<ProbeRequest>;
}

static OPENAI: OpenAIAdapter = OpenAIAdapter;
static AZURE: AzureAdapter = AzureAdapter;
static ANTHROPIC: AnthropicAdapter = AnthropicAdapter;
static GEMINI: GeminiAdapter = GeminiAdapter;
static MIDJOURNEY: PassthroughAdapter = PassthroughAdapter::midjourney();
static SUNO: PassthroughAdapter = PassthroughAdapter::suno();

pub fn adapter_for(channel_type: ChannelType) -> &'static dyn Adapter {
    match channel_type {
        ChannelType::Azure => &AZURE,
        ChannelType::Anthropic => &ANTHROPIC,
        ChannelType::Gemini => &GEMINI,
        ChannelType::Midjourney => &MIDJOURNEY,
        ChannelType::Suno => &SUNO,
        ChannelType::OpenAI | ChannelType::Custom | ChannelType::DeepSeek | ChannelType::Unknown => &OPENAI,
    }
}

pub(crate) fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), AdapterError> {
    let value = HeaderValue::from_str(value).map_err(|_| AdapterError::InvalidHeader(name))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// Replaces the top-level `model` of a JSON body when the channel maps it.
pub(crate) fn rewrite_model(info: &RelayInfo, body: &Bytes, edit: impl FnOnce(&mut Value)) -> Result<Bytes, AdapterError> {
    if body.is_empty() {
        return Ok(body.clone());
    }
    let mut value: Value = serde_json::from_slice(body).map_err(|e| AdapterError::InvalidBody(e.to_string()))?;
    if value.get("model").is_some() && info.upstream_model != info.origin_model {
        value["model"] = Value::String(info.upstream_model.clone());
    }
    edit(&mut value);
    serde_json::to_vec(&value)
        .map(Bytes::from)
        .map_err(|e| AdapterError::InvalidBody(e.to_string()))
}

pub(crate) fn is_json(info: &RelayInfo) -> bool {
    info.content_type
        .as_deref()
        .is_none_or(|ct| ct.contains("application/json"))
}

fn as_i64(value: Option<&Value>) -> i64 {
    value.and_then(Value::as_i64).unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::service::ledger::PriceData;
    use reqwest::Method;

    pub(crate) fn info(format: RelayFormat, path: &str, model: &str, upstream: &str, stream: bool) -> RelayInfo {
        RelayInfo {
            request_id: "req".into(),
            user_id: 1,
            user_group: "g_default".into(),
            using_group: "g_default".into(),
            user_quota: 0,
            token_id: 10,
            token_name: "t".into(),
            token_unlimited: false,
            origin_model: model.into(),
            upstream_model: upstream.into(),
            is_stream: stream,
            start_ms: 0,
            relay_format: format,
            method: Method::POST,
            request_path: path.into(),
            query: None,
            content_type: Some("application/json".into()),
            action: None,
            estimated_prompt_tokens: 1,
            max_tokens: 0,
            price: PriceData::default(),
            channel: None,
        }
    }

    #[test]
    fn test_dispatch_by_channel_type() {
        assert_eq!(adapter_for(ChannelType::DeepSeek).name(), "openai");
        assert_eq!(adapter_for(ChannelType::Anthropic).name(), "anthropic");
        assert_eq!(adapter_for(ChannelType::Suno).name(), "suno");
        assert!(adapter_for(ChannelType::Gemini).supports(RelayFormat::Gemini));
        assert!(!adapter_for(ChannelType::OpenAI).supports(RelayFormat::Anthropic));
    }

    #[test]
    fn test_rewrite_model_only_when_mapped() {
        let body = Bytes::from_static(br#"{"model":"m","x":1}"#);
        let unchanged = rewrite_model(&info(RelayFormat::OpenAI, "/v1/chat/completions", "m", "m", false), &body, |_| {}).unwrap();
        let value: Value = serde_json::from_slice(&unchanged).unwrap();
        assert_eq!(value["model"], "m");

        let mapped = rewrite_model(&info(RelayFormat::OpenAI, "/v1/chat/completions", "m", "m-2", false), &body, |_| {}).unwrap();
        let value: Value = serde_json::from_slice(&mapped).unwrap();
        assert_eq!(value["model"], "m-2");
        assert_eq!(value["x"], 1);

        assert!(rewrite_model(&info(RelayFormat::OpenAI, "/", "m", "m", false), &Bytes::from_static(b"{"), |_| {}).is_err());
    }
}
