use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::{KeeperError, PaymentCode};
use crate::model::payment::PaymentRequirements;

/// HTTP-facing errors. Every body carries a stable machine-readable `code`
/// next to the human-readable `error`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest { code: &'static str, message: String },
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict { code: &'static str, message: String, payment_id: Option<String> },
    PaymentRequired(Box<PaymentRequirements>),
    RateLimited { retry_after: u64 },
    Upstream(String),
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            code: "validation",
            message: message.into(),
        }
    }

    pub fn terminal_state(id: &str) -> Self {
        ApiError::Conflict {
            code: "terminal_state",
            message: format!("eigen {id} is in a terminal state"),
            payment_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest { code, message } => (
                StatusCode::BAD_REQUEST,
                json!({ "error": message, "code": code }),
            ),
            ApiError::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": message, "code": "unauthorized" }),
            ),
            ApiError::Forbidden(message) => (
                StatusCode::FORBIDDEN,
                json!({ "error": message, "code": "forbidden" }),
            ),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                json!({ "error": message, "code": "not_found" }),
            ),
            ApiError::Conflict { code, message, payment_id } => {
                let mut body = json!({ "error": message, "code": code });
                if let Some(id) = payment_id {
                    body["paymentId"] = json!(id);
                }
                (StatusCode::CONFLICT, body)
            }
            ApiError::PaymentRequired(requirements) => (
                StatusCode::PAYMENT_REQUIRED,
                serde_json::to_value(&*requirements)
                    .unwrap_or_else(|_| json!({ "code": "payment_required" })),
            ),
            ApiError::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": format!("rate limited, retry in {retry_after}s"),
                    "code": "rate_limited",
                    "retryAfter": retry_after,
                }),
            ),
            ApiError::Upstream(message) => (
                StatusCode::BAD_GATEWAY,
                json!({ "error": message, "code": "upstream" }),
            ),
            ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": message, "code": "internal" }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

impl From<KeeperError> for ApiError {
    fn from(e: KeeperError) -> Self {
        match e {
            KeeperError::Validation(message) => ApiError::BadRequest {
                code: "validation",
                message,
            },
            KeeperError::Auth(message) => ApiError::Forbidden(message),
            KeeperError::Payment { code, message } => match code {
                PaymentCode::AlreadyConsumed => ApiError::Conflict {
                    code: code.as_str(),
                    message: "payment already consumed".into(),
                    payment_id: Some(message),
                },
                _ => ApiError::BadRequest {
                    code: code.as_str(),
                    message,
                },
            },
            KeeperError::Upstream(message) => ApiError::Upstream(message),
            KeeperError::Revert(report) => ApiError::Upstream(report.to_string()),
            KeeperError::Invariant(message) => ApiError::Internal(message),
        }
    }
}
