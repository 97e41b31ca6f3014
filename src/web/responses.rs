use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::AppError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.into(),
                message: message.into(),
                details: None,
            }),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Failure as seen by an HTTP client.
#[derive(Debug)]
pub enum HttpError {
    BadRequest(String),
    NotFound(String),
    TooManyRequests(String),
    BadGateway(String),
    InternalServerError(String),
}

impl HttpError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            HttpError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            HttpError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            HttpError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            HttpError::BadRequest(_) => "BAD_REQUEST",
            HttpError::NotFound(_) => "NOT_FOUND",
            HttpError::TooManyRequests(_) => "QUOTA_EXHAUSTED",
            HttpError::BadGateway(_) => "UPSTREAM_FAILED",
            HttpError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            HttpError::BadRequest(msg)
            | HttpError::NotFound(msg)
            | HttpError::TooManyRequests(msg)
            | HttpError::BadGateway(msg)
            | HttpError::InternalServerError(msg) => msg,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}

impl From<AppError> for HttpError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound { resource } => HttpError::NotFound(format!("{} not found", resource)),
            AppError::Validation(msg) => HttpError::BadRequest(msg),
            AppError::QuotaExhausted(msg) => HttpError::TooManyRequests(msg),
            err @ (AppError::Scraping(_) | AppError::Render(_) | AppError::Blocked { .. } | AppError::Http(_)) => {
                HttpError::BadGateway(err.to_string())
            }
            other => {
                tracing::error!("Request failed: {}", other);
                HttpError::InternalServerError("Internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ApiResponse::<()>::error(self.error_code(), self.message());
        (status, Json(body)).into_response()
    }
}
