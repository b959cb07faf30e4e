use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::service::adapter::AdapterError;
use crate::service::authenticator::AuthError;
use crate::service::classifier::UpstreamFailure;
use crate::service::ledger::LedgerError;
use crate::service::limiter::LimitDenial;
use crate::service::pricing::PricingError;
use crate::service::selector::SelectError;

/// Shown to clients whenever a group limit turns them away.
pub const SATURATED_MESSAGE: &str = "当前分组上游负载已饱和，请稍后再试";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Quota(LedgerError),
    #[error("{}", SATURATED_MESSAGE)]
    RateLimited(LimitDenial),
    #[error("{0}")]
    NoChannel(#[from] SelectError),
    #[error("{}", .0.message)]
    Upstream(UpstreamFailure),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("{0}")]
    Local(String),
    #[error("{0}")]
    NotImplemented(String),
    #[error("client closed the request")]
    ClientCanceled,
}

impl From<PricingError> for RelayError {
    fn from(err: PricingError) -> Self {
        RelayError::Local(err.to_string())
    }
}

impl From<AdapterError> for RelayError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::InvalidBody(msg) => RelayError::InvalidRequest(msg),
            other => RelayError::Local(other.to_string()),
        }
    }
}

impl From<LedgerError> for RelayError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Store(e) => RelayError::Local(e.to_string()),
            quota => RelayError::Quota(quota),
        }
    }
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Auth(AuthError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Auth(AuthError::IpNotAllowed(_) | AuthError::GroupNotAllowed(_) | AuthError::ModelNotAllowed(_)) => {
                StatusCode::FORBIDDEN
            }
            RelayError::Auth(_) => StatusCode::UNAUTHORIZED,
            RelayError::Quota(_) => StatusCode::FORBIDDEN,
            RelayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            RelayError::NoChannel(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Upstream(failure) => match StatusCode::from_u16(failure.status) {
                Ok(status) if status.is_client_error() || status.is_server_error() => status,
                _ => StatusCode::BAD_GATEWAY,
            },
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::Local(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            RelayError::ClientCanceled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        }
    }

    /// Taxonomy kind, used in logs and recent-call entries.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Auth(_) => "auth",
            RelayError::Quota(_) => "quota",
            RelayError::RateLimited(_) => "rate_limit",
            RelayError::NoChannel(_) => "no_channel",
            RelayError::Upstream(_) => "upstream",
            RelayError::InvalidRequest(_) | RelayError::BodyTooLarge(_) | RelayError::Local(_) => "local",
            RelayError::NotImplemented(_) => "not_implemented",
            RelayError::ClientCanceled => "client_canceled",
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            RelayError::Auth(_) | RelayError::InvalidRequest(_) | RelayError::BodyTooLarge(_) => {
                "invalid_request_error"
            }
            RelayError::Quota(_) => "insufficient_quota",
            RelayError::RateLimited(_) => "rate_limit_error",
            RelayError::Upstream(_) => "upstream_error",
            _ => "relay_error",
        }
    }

    fn code(&self) -> String {
        match self {
            RelayError::Auth(AuthError::MissingKey | AuthError::InvalidKey) => "invalid_api_key".to_string(),
            RelayError::Auth(AuthError::TokenExpired) => "token_expired".to_string(),
            RelayError::Auth(AuthError::TokenExhausted) => "token_quota_exhausted".to_string(),
            RelayError::Auth(AuthError::ModelNotAllowed(_)) => "model_not_allowed".to_string(),
            RelayError::Auth(_) => "access_denied".to_string(),
            RelayError::Quota(LedgerError::InsufficientTokenQuota { .. }) => "pre_consume_token_quota_failed".to_string(),
            RelayError::Quota(_) => "insufficient_user_quota".to_string(),
            RelayError::RateLimited(denial) => format!("{}_limited", denial),
            RelayError::NoChannel(_) => "model_not_found".to_string(),
            RelayError::Upstream(failure) => failure
                .code
                .clone()
                .unwrap_or_else(|| format!("upstream_status_{}", failure.status)),
            RelayError::InvalidRequest(_) => "invalid_request".to_string(),
            RelayError::BodyTooLarge(_) => "request_body_too_large".to_string(),
            RelayError::Local(_) => "internal_error".to_string(),
            RelayError::NotImplemented(_) => "not_implemented".to_string(),
            RelayError::ClientCanceled => "client_canceled".to_string(),
        }
    }

    pub fn with_request_id(self, request_id: &str) -> ErrorResponse {
        ErrorResponse {
            error: self,
            request_id: request_id.to_string(),
        }
    }
}

/// A [`RelayError`] rendered as an OpenAI-style error object.
#[derive(Debug)]
pub struct ErrorResponse {
    pub error: RelayError,
    pub request_id: String,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": format!("{} (request id: {})", self.error, self.request_id),
                "type": self.error.error_type(),
                "code": self.error.code(),
            }
        });
        let mut response = (self.error.status(), Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_envelope_carries_request_id() {
        let response = RelayError::RateLimited(LimitDenial::Rpm).with_request_id("abc").into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-request-id"], "abc");
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], format!("{} (request id: abc)", SATURATED_MESSAGE));
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["code"], "rpm_limited");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(RelayError::Auth(AuthError::InvalidKey).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(RelayError::Auth(AuthError::IpNotAllowed("1.2.3.4".into())).status(), StatusCode::FORBIDDEN);
        assert_eq!(RelayError::BodyTooLarge(10).status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            RelayError::Upstream(UpstreamFailure::upstream(401, "invalid api key", None)).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(RelayError::Upstream(UpstreamFailure::sentinel("no choices returned")).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(RelayError::Upstream(UpstreamFailure::transport("reset")).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(RelayError::Upstream(UpstreamFailure::timeout("slow")).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(RelayError::ClientCanceled.status().as_u16(), 499);
    }
}
