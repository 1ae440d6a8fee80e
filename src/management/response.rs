//! # API 响应结构
//!
//! 管理端统一的 JSON 响应格式。

use crate::error::{ProxyError, Result};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// # 标准成功响应
#[derive(Debug, Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// # 标准错误信息
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// # 标准错误响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorInfo,
    pub timestamp: DateTime<Utc>,
}

/// # API响应枚举
#[derive(Debug)]
pub enum ApiResponse<T: Serialize> {
    Success(T),
    SuccessWithMessage(T, String),
    SuccessWithoutData(String),
    Error(StatusCode, String, String),
    AppError(ProxyError),
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let (status, data, message) = match self {
            Self::Success(data) => (StatusCode::OK, Some(data), "操作成功".to_string()),
            Self::SuccessWithMessage(data, message) => (StatusCode::OK, Some(data), message),
            Self::SuccessWithoutData(message) => (StatusCode::OK, None, message),
            Self::Error(status, code, message) => return error_response(status, code, message),
            Self::AppError(error) => {
                let (status, code) = error_code(&error);
                return error_response(status, code.to_string(), error.to_string());
            }
        };
        (
            status,
            Json(SuccessResponse {
                success: true,
                data,
                message: Some(message),
                timestamp: Utc::now(),
            }),
        )
            .into_response()
    }
}

fn error_response(status: StatusCode, code: String, message: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: ErrorInfo { code, message },
            timestamp: Utc::now(),
        }),
    )
        .into_response()
}

/// 管理端错误码
fn error_code(error: &ProxyError) -> (StatusCode, &'static str) {
    match error.root() {
        ProxyError::Auth { .. } => (StatusCode::UNAUTHORIZED, "AUTH_ERROR"),
        ProxyError::Business { .. } | ProxyError::Serialization { .. } => {
            (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
        }
        ProxyError::NotFound { .. } => (StatusCode::NOT_FOUND, "RESOURCE_NOT_FOUND"),
        ProxyError::Config { .. } => (StatusCode::BAD_REQUEST, "CONFIG_ERROR"),
        ProxyError::CredentialRefreshFailed { .. } => {
            (StatusCode::BAD_GATEWAY, "CREDENTIAL_REFRESH_FAILED")
        }
        ProxyError::Transport { .. } | ProxyError::Upstream { .. } => {
            (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

/// # 便捷函数：成功响应
pub fn success<T: Serialize>(data: T) -> Response {
    ApiResponse::Success(data).into_response()
}

/// # 便捷函数：带消息的成功响应
pub fn success_with_message<T: Serialize>(data: T, message: &str) -> Response {
    ApiResponse::SuccessWithMessage(data, message.to_string()).into_response()
}

/// # 便捷函数：无数据体的成功响应
pub fn success_without_data(message: &str) -> Response {
    ApiResponse::<()>::SuccessWithoutData(message.to_string()).into_response()
}

/// # 便捷函数：HTTP错误响应
pub fn error(status: StatusCode, code: &str, message: &str) -> Response {
    ApiResponse::<()>::Error(status, code.to_string(), message.to_string()).into_response()
}

/// # 便捷函数：应用错误响应
pub fn app_error(error: ProxyError) -> Response {
    ApiResponse::<()>::AppError(error).into_response()
}

/// 按结果生成成功或错误响应
pub fn from_result<T: Serialize>(result: Result<T>, message: &str) -> Response {
    match result {
        Ok(data) => success_with_message(data, message),
        Err(e) => app_error(e),
    }
}
