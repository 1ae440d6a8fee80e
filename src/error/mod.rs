//! The unified error handling system for the application.

use axum::Json;
use axum::response::{IntoResponse, Response};

pub use types::ProxyError;

/// A unified `Result` type for the entire application.
///
/// All functions that can fail should return this type.
pub type Result<T> = std::result::Result<T, ProxyError>;

pub mod macros;
pub mod types;

/// Context trait for adding context to errors.
pub trait Context<T, E> {
    #[track_caller]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display;

    #[track_caller]
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: std::fmt::Display;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: Into<ProxyError>,
{
    #[track_caller]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display,
    {
        self.with_context(|| context)
    }

    #[track_caller]
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: std::fmt::Display,
    {
        match self {
            Ok(value) => Ok(value),
            Err(error) => Err(ProxyError::Context {
                context: context().to_string(),
                source: Box::new(error.into()),
            }),
        }
    }
}

/// Claude 风格的错误响应体
#[must_use]
pub fn error_body(error_type: &str, message: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": message,
        }
    })
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.to_http_response_parts();
        (status, Json(error_body(error_type, &self.client_message()))).into_response()
    }
}

impl ProxyError {
    /// 返回给 Claude 兼容客户端的固定英文消息；上游与内部细节不对外暴露
    #[must_use]
    pub fn client_message(&self) -> String {
        match self.root() {
            Self::NoEligibleAccount { .. } => {
                "No upstream account is available, please retry later".to_string()
            }
            Self::CredentialRefreshFailed { .. } => {
                "Upstream credential unavailable, please retry later".to_string()
            }
            Self::UpstreamRateLimited { .. } => {
                "Upstream rate limit reached, please retry later".to_string()
            }
            Self::Transport { .. } => "Upstream connection failed, please retry later".to_string(),
            Self::Upstream { .. } | Self::Internal { .. } | Self::Io { .. } | Self::Context { .. } => {
                "Internal server error".to_string()
            }
            Self::Config { .. } | Self::UnsupportedProfile { .. } => {
                "Gateway is misconfigured".to_string()
            }
            Self::Auth { message } | Self::Business { message } => message.clone(),
            Self::Serialization { .. } => "Request body could not be parsed".to_string(),
            Self::NotFound {
                resource_type,
                identifier,
            } => format!("{resource_type} {identifier} not found"),
        }
    }
}

#[cfg(test)]
mod tests;
