// API 错误类型

use crate::downloader::DownloadError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::handlers::ApiResponse;

/// API 错误
///
/// 响应体与成功响应格式一致: `{code, message}`，`code` 为 HTTP 状态码
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        let status = match &err {
            DownloadError::NotFound(_) => StatusCode::NOT_FOUND,
            DownloadError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            DownloadError::AlreadyExists(_) => StatusCode::CONFLICT,
            DownloadError::MaxConcurrentReached { .. } => StatusCode::TOO_MANY_REQUESTS,
            DownloadError::DownloadFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()>::error(self.status.as_u16() as i32, self.message);
        (self.status, Json(body)).into_response()
    }
}
