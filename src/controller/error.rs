use axum::{
    response::{IntoResponse, Response},
    Json,
};
use reqwest::StatusCode;
use serde_json::json;

use crate::service::health::HealthError;
use crate::service::store::StoreError;

#[derive(Debug)]
pub enum BaseError {
    ParamInvalid(Option<String>),
    NotFound(Option<String>),
    Unauthorized(Option<String>),
    Forbidden(Option<String>),
    Conflict(Option<String>),
    StoreError(Option<String>),
    InternalServerError(Option<String>),
}

impl From<StoreError> for BaseError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => BaseError::NotFound(Some(msg)),
            other => BaseError::StoreError(Some(other.to_string())),
        }
    }
}

impl From<HealthError> for BaseError {
    fn from(err: HealthError) -> Self {
        match err {
            HealthError::AlreadyRunning => BaseError::Conflict(Some(err.to_string())),
            HealthError::ChannelNotFound(_) => BaseError::NotFound(Some(err.to_string())),
            HealthError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for BaseError {
    fn into_response(self) -> Response {
        let (status, error_code, error_message) = match self {
            BaseError::ParamInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                1001,
                msg.unwrap_or("request params invalid".to_string()),
            ),
            BaseError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                1002,
                msg.unwrap_or("data not found".to_string()),
            ),
            BaseError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                1003,
                msg.unwrap_or("Unauthorized".to_string()),
            ),
            BaseError::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                1004,
                msg.unwrap_or("admin access required".to_string()),
            ),
            BaseError::Conflict(msg) => (
                StatusCode::CONFLICT,
                1005,
                msg.unwrap_or("operation already in progress".to_string()),
            ),
            BaseError::StoreError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                1200,
                msg.unwrap_or("store operation failed".to_string()),
            ),
            BaseError::InternalServerError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                0,
                msg.unwrap_or("internal server error".to_string()),
            ),
        };
        let body = Json(json!({
            "code": error_code,
            "msg": error_message,
        }));
        (status, body).into_response()
    }
}
