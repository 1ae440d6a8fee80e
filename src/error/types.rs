//! # 错误类型定义

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// 应用主要错误类型
#[derive(Debug, Error)]
pub enum ProxyError {
    /// 没有可调度的账号
    #[error("没有可用账号: {message}")]
    NoEligibleAccount { message: String },

    /// OAuth 凭证刷新失败，本次请求不可用该账号
    #[error("凭证刷新失败: account={account_id}, {message}")]
    CredentialRefreshFailed { account_id: String, message: String },

    /// 上游限流，账号进入冷却
    #[error("上游限流: account={account_id}, until={until}")]
    UpstreamRateLimited {
        account_id: String,
        until: DateTime<Utc>,
    },

    /// 上游返回的其它非 2xx 响应
    #[error("上游错误: status={status}, body={}", body_preview(body))]
    Upstream { status: u16, body: bytes::Bytes },

    /// 与上游通信失败（连接、超时）
    #[error("网络错误: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 配置相关错误
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 客户端或管理端认证错误
    #[error("认证错误: {message}")]
    Auth { message: String },

    /// 业务校验错误
    #[error("业务错误: {message}")]
    Business { message: String },

    /// 资源未找到
    #[error("资源未找到: {resource_type} {identifier}")]
    NotFound {
        resource_type: String,
        identifier: String,
    },

    /// 请求头组合不存在（平台与凭证类型不受支持）
    #[error("不支持的请求头组合: platform={platform}, kind={kind}")]
    UnsupportedProfile { platform: String, kind: String },

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// IO相关错误
    #[error("IO错误: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// 附加上下文的错误
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProxyError>,
    },
}

/// 日志中展示的上游响应体片段
const BODY_PREVIEW_CHARS: usize = 256;

fn body_preview(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(BODY_PREVIEW_CHARS)
        .collect()
}

impl ProxyError {
    /// 将错误转换为HTTP状态码和错误类型
    #[must_use]
    pub fn to_http_response_parts(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NoEligibleAccount { .. } => (StatusCode::SERVICE_UNAVAILABLE, "overloaded_error"),
            Self::CredentialRefreshFailed { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "credential_unavailable")
            }
            Self::UpstreamRateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
            Self::Upstream { .. } | Self::Internal { .. } | Self::Io { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "api_error")
            }
            Self::Transport { .. } => (StatusCode::BAD_GATEWAY, "upstream_error"),
            Self::Config { .. } | Self::UnsupportedProfile { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "api_error")
            }
            Self::Auth { .. } => (StatusCode::UNAUTHORIZED, "authentication_error"),
            Self::Business { .. } | Self::Serialization { .. } => {
                (StatusCode::BAD_REQUEST, "invalid_request_error")
            }
            Self::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found_error"),
            Self::Context { source, .. } => source.to_http_response_parts(),
        }
    }

    /// 去掉上下文包装后的根错误
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// 调用方稍后重试（或换账号重试）是否可能成功
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::NoEligibleAccount { .. }
                | Self::CredentialRefreshFailed { .. }
                | Self::UpstreamRateLimited { .. }
                | Self::Transport { .. }
        )
    }

    /// 错误是否由具体账号引起（换一个账号可能成功）
    #[must_use]
    pub fn is_account_fault(&self) -> bool {
        matches!(
            self.root(),
            Self::CredentialRefreshFailed { .. }
                | Self::UpstreamRateLimited { .. }
                | Self::Transport { .. }
        )
    }

    /// 创建无可用账号错误
    pub fn no_eligible_account<T: Into<String>>(message: T) -> Self {
        Self::NoEligibleAccount {
            message: message.into(),
        }
    }

    /// 创建凭证刷新失败错误
    pub fn credential_refresh_failed<A: Into<String>, T: Into<String>>(
        account_id: A,
        message: T,
    ) -> Self {
        Self::CredentialRefreshFailed {
            account_id: account_id.into(),
            message: message.into(),
        }
    }

    /// 创建网络错误
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的网络错误
    pub fn transport_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建配置错误
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的配置错误
    pub fn config_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建认证错误
    pub fn auth<T: Into<String>>(message: T) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// 创建业务错误
    pub fn business<T: Into<String>>(message: T) -> Self {
        Self::Business {
            message: message.into(),
        }
    }

    /// 创建资源未找到错误
    pub fn not_found<T: Into<String>, I: Into<String>>(resource_type: T, identifier: I) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            identifier: identifier.into(),
        }
    }

    /// 创建内部错误
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的内部错误
    pub fn internal_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

// 自动转换常见错误类型
impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: "文件操作失败".to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        Self::config_with_source("TOML解析失败", err)
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: "JSON处理失败".to_string(),
            source: err.into(),
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "上游请求超时"
        } else if err.is_connect() {
            "上游连接失败"
        } else {
            "HTTP请求失败"
        };
        Self::transport_with_source(message, err)
    }
}
