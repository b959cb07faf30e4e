use reqwest::Method;
use serde_json::Value;

use super::authenticator::AuthContext;
use super::cache::types::CacheChannel;
use super::ledger::PriceData;
use crate::schema::enum_def::ChannelType;
use crate::utils::count_text_chars;

/// Wire dialect of the inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RelayFormat {
    OpenAI,
    Anthropic,
    Gemini,
    /// Vendor task endpoints (`/mj/*`, `/suno/*`), forwarded unchanged.
    Task,
}

/// What the request parser extracted from the inbound call.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub format: RelayFormat,
    pub method: Method,
    /// Path as the upstream should see it, e.g. `/v1/chat/completions`.
    pub path: String,
    pub query: Option<String>,
    pub content_type: Option<String>,
    pub model: String,
    pub is_stream: bool,
    pub prompt_tokens: i64,
    pub max_tokens: i64,
    /// Gemini method suffix (`generateContent`, `streamGenerateContent`, ...).
    pub action: Option<String>,
}

impl RequestMeta {
    pub fn new(format: RelayFormat, method: Method, path: impl Into<String>) -> Self {
        Self {
            format,
            method,
            path: path.into(),
            query: None,
            content_type: None,
            model: String::new(),
            is_stream: false,
            prompt_tokens: 1,
            max_tokens: 0,
            action: None,
        }
    }
}

/// The upstream side of an attempt.
#[derive(Debug, Clone)]
pub struct ChannelMeta {
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub channel_name: String,
    pub base_url: String,
    pub key_index: usize,
    pub auto_ban: bool,
}

#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub request_id: String,
    pub user_id: i64,
    pub user_group: String,
    pub using_group: String,
    pub user_quota: i64,
    pub token_id: i64,
    pub token_name: String,
    pub token_unlimited: bool,
    pub origin_model: String,
    pub upstream_model: String,
    pub is_stream: bool,
    pub start_ms: i64,
    pub relay_format: RelayFormat,
    pub method: Method,
    pub request_path: String,
    pub query: Option<String>,
    pub content_type: Option<String>,
    pub action: Option<String>,
    pub estimated_prompt_tokens: i64,
    pub max_tokens: i64,
    pub price: PriceData,
    pub channel: Option<ChannelMeta>,
}

impl RelayInfo {
    /// `using_group` is copied from the context as is; `auto` is resolved by the selector.
    pub fn build(request_id: String, ctx: &AuthContext, meta: RequestMeta, start_ms: i64) -> Self {
        Self {
            request_id,
            user_id: ctx.user.id,
            user_group: ctx.user.group.clone(),
            using_group: ctx.using_group.clone(),
            user_quota: ctx.user.quota,
            token_id: ctx.token.id,
            token_name: ctx.token.name.clone(),
            token_unlimited: ctx.token.unlimited_quota,
            upstream_model: meta.model.clone(),
            origin_model: meta.model,
            is_stream: meta.is_stream,
            start_ms,
            relay_format: meta.format,
            method: meta.method,
            request_path: meta.path,
            query: meta.query,
            content_type: meta.content_type,
            action: meta.action,
            estimated_prompt_tokens: meta.prompt_tokens,
            max_tokens: meta.max_tokens,
            price: PriceData::default(),
            channel: None,
        }
    }

    /// Synthetic info for a health probe. Nobody is billed for it.
    pub fn for_probe(request_id: String, channel: &CacheChannel, model: &str, format: RelayFormat, path: &str, start_ms: i64) -> Self {
        let mut info = Self {
            request_id,
            user_id: 0,
            user_group: String::new(),
            using_group: String::new(),
            user_quota: 0,
            token_id: 0,
            token_name: String::new(),
            token_unlimited: true,
            origin_model: model.to_string(),
            upstream_model: model.to_string(),
            is_stream: false,
            start_ms,
            relay_format: format,
            method: Method::POST,
            request_path: path.to_string(),
            query: None,
            content_type: Some("application/json".to_string()),
            action: (format == RelayFormat::Gemini).then(|| "generateContent".to_string()),
            estimated_prompt_tokens: 1,
            max_tokens: 1,
            price: PriceData { free_model: true, ..Default::default() },
            channel: None,
        };
        info.bind_channel(channel, 0);
        info
    }

    /// Points the info at `channel` for the next attempt.
    pub fn bind_channel(&mut self, channel: &CacheChannel, key_index: usize) {
        self.upstream_model = channel.upstream_model(&self.origin_model);
        self.channel = Some(ChannelMeta {
            channel_id: channel.id,
            channel_type: channel.channel_type,
            channel_name: channel.name.clone(),
            base_url: channel.base_url.trim_end_matches('/').to_string(),
            key_index,
            auto_ban: channel.auto_ban,
        });
    }

    pub fn channel_id(&self) -> Option<i64> {
        self.channel.as_ref().map(|c| c.channel_id)
    }

    pub fn elapsed_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.start_ms).max(0)
    }
}

/// Character count of the textual input over four, at least one.
pub fn estimate_prompt_tokens(body: &Value) -> i64 {
    let chars = count_text_chars(body) as i64;
    (chars / 4).max(1)
}

/// Completion budget the client asked for, 0 when unspecified.
pub fn requested_max_tokens(body: &Value) -> i64 {
    ["max_tokens", "max_completion_tokens", "max_output_tokens"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_i64))
        .or_else(|| {
            body.get("generationConfig")
                .and_then(|c| c.get("maxOutputTokens"))
                .and_then(Value::as_i64)
        })
        .unwrap_or(0)
        .max(0)
}
