use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub const RATE_LIMIT_MESSAGE: &str =
    "This endpoint has been requested too many times. Try again later.";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("401 unauthorized")]
    Unauthorized,

    #[error("403 forbidden")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Field-keyed validation errors, rendered as `{"message": {field: [..]}}`.
    #[error("validation failed")]
    Validation(serde_json::Value),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unprocessable: {0}")]
    Unprocessable(String),

    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("rate limit exceeded")]
    TooManyRequests,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(field: &str, errors: &[&str]) -> ApiError {
        ApiError::Validation(json!({ field: errors }))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "message": "401 Unauthorized" }),
            ),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                json!({ "message": "403 Forbidden" }),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                json!({ "message": format!("404 {} Not Found", resource) }),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::Validation(errors) => {
                (StatusCode::BAD_REQUEST, json!({ "message": errors }))
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "message": msg })),
            ApiError::Unprocessable(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, json!({ "message": msg }))
            }
            ApiError::MethodNotAllowed(msg) => {
                (StatusCode::METHOD_NOT_ALLOWED, json!({ "message": msg }))
            }
            ApiError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({ "message": "413 Request Entity Too Large" }),
            ),
            ApiError::TooManyRequests => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "message": { "error": RATE_LIMIT_MESSAGE } }),
            ),
            ApiError::Internal(e) => {
                tracing::error!("internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "message": "500 Internal Server Error" }),
                )
            }
        };

        let mut response = (status, Json(body)).into_response();

        if matches!(self, ApiError::TooManyRequests) {
            response
                .headers_mut()
                .insert("retry-after", axum::http::HeaderValue::from_static("60"));
        }

        response
    }
}
