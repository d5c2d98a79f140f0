use axum::Json;
use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::cache::StoreError;
use crate::utils::{error_codes, headers};

/// 准入引擎内部错误，不会传递给请求方
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("{backend} store failed during {op}: {source}")]
    Store {
        backend: &'static str,
        op: &'static str,
        #[source]
        source: StoreError,
    },
}

/// 被拒绝请求的响应
#[derive(Debug)]
pub enum AppError {
    RateLimited { message: String, retry_after: u64 },
    Blocked { retry_after: u64 },
}

#[derive(Serialize)]
struct ErrorResponse {
    code: i32,
    error: &'static str,
    error_message: String,
    retry_after: u64,
    blocked: bool,
}

impl AppError {
    pub fn retry_after(&self) -> u64 {
        match self {
            AppError::RateLimited { retry_after, .. } | AppError::Blocked { retry_after } => {
                *retry_after
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after();
        let (code, error_message, blocked) = match self {
            AppError::RateLimited { message, .. } => (error_codes::RATE_LIMIT, message, false),
            AppError::Blocked { retry_after } => (
                error_codes::BLOCKED,
                format!("访问已被临时封禁，请在{}秒后重试", retry_after),
                true,
            ),
        };

        let body = Json(ErrorResponse {
            code,
            error: error_codes::RATE_LIMITED,
            error_message,
            retry_after,
            blocked,
        });

        let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        response
            .headers_mut()
            .insert(headers::RETRY_AFTER, HeaderValue::from(retry_after));
        response
    }
}
