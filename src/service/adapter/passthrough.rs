use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::Value;

use super::{set_header, Adapter, AdapterError, ProbeRequest};
use crate::service::ledger::Usage;
use crate::service::relay_info::{RelayFormat, RelayInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskVendor {
    Midjourney,
    Suno,
}

/// Task-style vendors. Bodies go upstream unchanged and calls are priced per request.
pub struct PassthroughAdapter {
    vendor: TaskVendor,
}

// Midjourney proxy submit codes that mean the task was taken.
const MJ_ACCEPTED: &[i64] = &[1, 21, 22];

impl PassthroughAdapter {
    pub const fn midjourney() -> Self {
        Self { vendor: TaskVendor::Midjourney }
    }

    pub const fn suno() -> Self {
        Self { vendor: TaskVendor::Suno }
    }
}

impl Adapter for PassthroughAdapter {
    fn name(&self) -> &'static str {
        match self.vendor {
            TaskVendor::Midjourney => "midjourney",
            TaskVendor::Suno => "suno",
        }
    }

    fn supports(&self, format: RelayFormat) -> bool {
        format == RelayFormat::Task
    }

    fn request_url(&self, base_url: &str, info: &RelayInfo) -> Result<String, AdapterError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), info.request_path);
        Ok(match info.query.as_deref().filter(|q| !q.is_empty()) {
            Some(query) => format!("{}?{}", url, query),
            None => url,
        })
    }

    fn auth_headers(&self, key: &str, headers: &mut HeaderMap) -> Result<(), AdapterError> {
        match self.vendor {
            TaskVendor::Midjourney => set_header(headers, "mj-api-secret", key),
            TaskVendor::Suno => set_header(headers, "authorization", &format!("Bearer {}", key)),
        }
    }

    fn convert_request(&self, _info: &RelayInfo, body: &Bytes) -> Result<Bytes, AdapterError> {
        Ok(body.clone())
    }

    fn usage(&self, _body: &Value) -> Option<Usage> {
        Some(Usage::default())
    }

    fn stream_usage(&self, _event: &Value, _usage: &mut Usage) {}

    fn sentinel(&self, info: &RelayInfo, body: &Value) -> Option<String> {
        if self.vendor != TaskVendor::Midjourney || !info.request_path.contains("/submit/") {
            return None;
        }
        let code = body.get("code").and_then(Value::as_i64)?;
        if MJ_ACCEPTED.contains(&code) {
            return None;
        }
        let description = body
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("task submission rejected");
        Some(format!("midjourney code {}: {}", code, description))
    }

    /// Task vendors have no cheap call to probe with.
    fn probe_request(&self, _model: &str) -> Option<ProbeRequest> {
        None
    }
}
