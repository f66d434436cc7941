use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::panel::PanelError;
use crate::payment::PaymentError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Request-level error. Every handler returns this and actix renders it
/// as `{"detail": ...}` with the matching status code.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed input, rejected before any side effect
    #[error("{0}")]
    Validation(String),

    /// Telegram init data or admin token did not check out
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    /// Already exists, already applied, already used
    #[error("{0}")]
    Conflict(String),

    #[error("No available panels")]
    NoPanelAvailable,

    #[error("panel error: {0}")]
    Panel(#[from] PanelError),

    #[error("payment gateway error: {0}")]
    Payment(#[from] PaymentError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError::Conflict(msg.into())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NoPanelAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Panel(_) | ApiError::Payment(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "detail": self.to_string() }))
    }
}
