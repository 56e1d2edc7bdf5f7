use axum::{http::{StatusCode, HeaderValue}, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use uuid::Uuid;

/// One guard-rail window breach, reported inside a 402 body.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SpendViolation {
    pub window: String,
    pub spent: f64,
    pub estimated: f64,
    pub limit: f64,
}

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")] pub message: Option<String>,
    pub request_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")] pub violations: Option<Vec<SpendViolation>>,
}

#[derive(Debug)]
pub enum ApiError {
    Malformed { code: &'static str, request_id: Option<Uuid>, message: Option<String> },
    Unauthenticated { request_id: Option<Uuid> },
    LimitExceeded { request_id: Option<Uuid>, violations: Vec<SpendViolation> },
    Forbidden { request_id: Option<Uuid>, reason: Option<String> },
    NotFound { code: &'static str, request_id: Option<Uuid> },
    Conflict { code: &'static str, request_id: Option<Uuid>, message: Option<String> },
    RateLimited { request_id: Option<Uuid> },
    UpstreamFailure { request_id: Option<Uuid>, message: Option<String> },
    CircuitOpen { request_id: Option<Uuid>, retry_after_secs: u64 },
    Timeout { request_id: Option<Uuid> },
    Internal { request_id: Option<Uuid>, message: Option<String> },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E, request_id: Option<Uuid>) -> Self {
        Self::Internal { request_id, message: Some(e.to_string()) }
    }
    pub fn malformed(code: &'static str, request_id: Option<Uuid>) -> Self {
        Self::Malformed { code, request_id, message: None }
    }
    pub fn upstream<E: std::fmt::Display>(e: E, request_id: Option<Uuid>) -> Self {
        Self::UpstreamFailure { request_id, message: Some(e.to_string()) }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut retry_after = None;
        let (status, error_code, request_id, message, violations) = match self {
            ApiError::Malformed { code, request_id, message } => {
                (StatusCode::BAD_REQUEST, code, request_id, message, None)
            }
            ApiError::Unauthenticated { request_id } => {
                (StatusCode::UNAUTHORIZED, "unauthenticated", request_id, None, None)
            }
            ApiError::LimitExceeded { request_id, violations } => (
                StatusCode::PAYMENT_REQUIRED,
                "limit_exceeded",
                request_id,
                None,
                Some(violations),
            ),
            ApiError::Forbidden { request_id, reason } => {
                (StatusCode::FORBIDDEN, "forbidden", request_id, reason, None)
            }
            ApiError::NotFound { code, request_id } => {
                (StatusCode::NOT_FOUND, code, request_id, None, None)
            }
            ApiError::Conflict { code, request_id, message } => {
                (StatusCode::CONFLICT, code, request_id, message, None)
            }
            ApiError::RateLimited { request_id } => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limited", request_id, None, None)
            }
            ApiError::UpstreamFailure { request_id, message } => {
                (StatusCode::BAD_GATEWAY, "upstream_failure", request_id, message, None)
            }
            ApiError::CircuitOpen { request_id, retry_after_secs } => {
                retry_after = Some(retry_after_secs);
                (StatusCode::SERVICE_UNAVAILABLE, "circuit_open", request_id, None, None)
            }
            ApiError::Timeout { request_id } => {
                (StatusCode::GATEWAY_TIMEOUT, "timeout", request_id, None, None)
            }
            ApiError::Internal { request_id, message } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", request_id, message, None)
            }
        };
        let body = ErrorBody {
            error: error_code.into(),
            message,
            request_id: request_id.unwrap_or_else(Uuid::new_v4),
            violations,
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        if let Some(secs) = retry_after {
            if let Ok(val) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert("Retry-After", val);
            }
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
