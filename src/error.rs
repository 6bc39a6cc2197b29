use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cyder_tools::log::error;
use serde_json::json;
use thiserror::Error;

use crate::service::cache::CacheError;

/// Errors raised by the persistence and cache layers. Never shown to callers verbatim.
#[derive(Debug, Error)]
pub enum BaseError {
    #[error("invalid parameter: {}", .0.as_deref().unwrap_or("request params invalid"))]
    ParamInvalid(Option<String>),
    #[error("database error: {}", .0.as_deref().unwrap_or("database unknown error"))]
    DatabaseFatal(Option<String>),
    #[error("duplicate record: {}", .0.as_deref().unwrap_or("some unique keys have conflicted"))]
    DatabaseDup(Option<String>),
    #[error("not found: {}", .0.as_deref().unwrap_or("data not found"))]
    NotFound(Option<String>),
    #[error("store error: {}", .0.as_deref().unwrap_or("cache/store operation failed"))]
    StoreError(Option<String>),
    #[error("internal error: {}", .0.as_deref().unwrap_or("internal server error"))]
    InternalServerError(Option<String>),
}

impl From<diesel::result::Error> for BaseError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => BaseError::NotFound(None),
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                info,
            ) => BaseError::DatabaseDup(Some(info.message().to_string())),
            other => BaseError::DatabaseFatal(Some(other.to_string())),
        }
    }
}

impl From<CacheError> for BaseError {
    fn from(err: CacheError) -> Self {
        BaseError::StoreError(Some(err.to_string()))
    }
}

/// Client-facing failure taxonomy. Every variant renders the OpenAI error body.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Authentication(String),
    #[error("{0}")]
    RateLimit(String),
    #[error("{0}")]
    InsufficientQuota(String),
    #[error("{message}")]
    InvalidRequest {
        message: String,
        param: Option<String>,
    },
    #[error("{0}")]
    PermissionDenied(String),
    #[error("The model `{0}` does not exist or you do not have access to it.")]
    ModelNotFound(String),
    #[error("No available channel for model `{0}`.")]
    NoAvailableChannel(String),
    #[error("{message}")]
    UpstreamRejected { status: StatusCode, message: String },
    #[error("{0}")]
    UpstreamUnavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// Client-facing form of an upstream content rejection. The upstream's
    /// own text is kept out of the response.
    pub fn upstream_rejected(upstream_status: Option<StatusCode>) -> Self {
        let (status, message) = match upstream_status {
            Some(StatusCode::PAYLOAD_TOO_LARGE) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "The request is too large for this model.",
            ),
            Some(StatusCode::UNPROCESSABLE_ENTITY) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "The model could not process the request parameters.",
            ),
            _ => (
                StatusCode::BAD_REQUEST,
                "The model rejected the request. Check the messages and parameters.",
            ),
        };
        GatewayError::UpstreamRejected {
            status,
            message: message.to_string(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        GatewayError::InvalidRequest {
            message: message.into(),
            param: None,
        }
    }

    pub fn missing_param(param: &str) -> Self {
        GatewayError::InvalidRequest {
            message: format!("you must provide a {} parameter", param),
            param: Some(param.to_string()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InsufficientQuota(_) => StatusCode::PAYMENT_REQUIRED,
            GatewayError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            GatewayError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::ModelNotFound(_) | GatewayError::NoAvailableChannel(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::UpstreamRejected { status, .. } => *status,
            GatewayError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) => "authentication_error",
            GatewayError::RateLimit(_) => "rate_limit_error",
            GatewayError::InsufficientQuota(_) => "insufficient_quota",
            GatewayError::InvalidRequest { .. }
            | GatewayError::ModelNotFound(_)
            | GatewayError::NoAvailableChannel(_)
            | GatewayError::UpstreamRejected { .. } => "invalid_request_error",
            GatewayError::PermissionDenied(_) => "permission_error",
            GatewayError::UpstreamUnavailable(_) => "upstream_error",
            GatewayError::Internal(_) => "server_error",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) => "invalid_api_key",
            GatewayError::RateLimit(_) => "rate_limit_exceeded",
            GatewayError::InsufficientQuota(_) => "insufficient_quota",
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::PermissionDenied(_) => "model_not_allowed",
            GatewayError::ModelNotFound(_) => "model_not_found",
            GatewayError::NoAvailableChannel(_) => "no_available_channel",
            GatewayError::UpstreamRejected { .. } => "upstream_rejected",
            GatewayError::UpstreamUnavailable(_) => "upstream_unavailable",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn param(&self) -> Option<&str> {
        match self {
            GatewayError::InvalidRequest { param, .. } => param.as_deref(),
            GatewayError::ModelNotFound(_)
            | GatewayError::NoAvailableChannel(_)
            | GatewayError::PermissionDenied(_) => Some("model"),
            _ => None,
        }
    }

    pub fn to_body(&self) -> serde_json::Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "param": self.param(),
                "code": self.code(),
            }
        })
    }
}

impl From<BaseError> for GatewayError {
    fn from(err: BaseError) -> Self {
        error!("internal failure: {}", err);
        GatewayError::Internal("The server had an error while processing your request.".to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_body())).into_response()
    }
}
