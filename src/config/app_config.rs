//! # 应用配置结构定义

use crate::passthrough::ErrorPassthroughRule;
use crate::types::{AccountRecord, Proxy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// 应用主配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 监听与管理端配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 转发管道配置
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// 限流冷却配置
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// OAuth 端点配置
    #[serde(default)]
    pub oauth: OAuthConfig,
    /// 允许访问网关的客户端密钥
    #[serde(default)]
    pub clients: Vec<ClientKeyConfig>,
    /// 内存存储的初始数据
    #[serde(default)]
    pub seed: SeedConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 管理端 Bearer 令牌，未配置时管理端拒绝所有请求
    #[serde(skip_serializing)]
    pub admin_token: Option<String>,
    /// 入站请求体上限（字节）
    pub request_body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            admin_token: None,
            request_body_limit: 32 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// 监听地址
    pub fn socket_addr(&self) -> crate::error::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port).parse().map_err(|e| {
            crate::error::ProxyError::config_with_source(
                format!("无效的监听地址: {}:{}", self.host, self.port),
                e,
            )
        })
    }
}

/// 转发管道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// 单个请求最多尝试的账号数
    pub max_attempts: u32,
    /// 上游错误响应体捕获上限（字节）
    pub error_body_limit: usize,
    /// 等待上游响应头的超时（秒）
    pub response_header_timeout_secs: u64,
    /// 建立连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 空闲连接保留时间（秒）
    pub pool_idle_timeout_secs: u64,
    /// 流式转发的缓冲块数
    pub stream_channel_capacity: usize,
    /// 连续网络失败多少次后记录账号错误
    pub transport_failure_threshold: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            error_body_limit: 64 * 1024,
            response_header_timeout_secs: 300,
            connect_timeout_secs: 10,
            pool_idle_timeout_secs: 90,
            stream_channel_capacity: 32,
            transport_failure_threshold: 3,
        }
    }
}

impl GatewayConfig {
    /// 响应头超时
    #[must_use]
    pub const fn response_header_timeout(&self) -> Duration {
        Duration::from_secs(self.response_header_timeout_secs)
    }

    /// 连接超时
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// 空闲连接超时
    #[must_use]
    pub const fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

/// 限流冷却配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 上游未给出重试提示时的冷却时长（秒）
    pub default_cooldown_secs: u64,
    /// 冷却时长上限（秒）
    pub max_cooldown_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_cooldown_secs: 60,
            max_cooldown_secs: 5 * 60 * 60,
        }
    }
}

/// OAuth 端点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// 客户端ID
    pub client_id: String,
    /// 授权页地址
    pub authorize_url: String,
    /// 令牌交换地址
    pub token_url: String,
    /// 回调地址
    pub redirect_uri: String,
    /// 完整授权范围
    pub scopes: String,
    /// setup token 的授权范围
    pub setup_token_scope: String,
    /// claude.ai 地址，用于 sessionKey 授权
    pub claude_ai_base_url: String,
    /// 令牌过期前提前刷新的秒数
    pub refresh_skew_secs: i64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string(),
            authorize_url: "https://claude.ai/oauth/authorize".to_string(),
            token_url: "https://console.anthropic.com/v1/oauth/token".to_string(),
            redirect_uri: "https://console.anthropic.com/oauth/code/callback".to_string(),
            scopes: "org:create_api_key user:profile user:inference".to_string(),
            setup_token_scope: "user:inference".to_string(),
            claude_ai_base_url: "https://claude.ai".to_string(),
            refresh_skew_secs: 300,
        }
    }
}

/// 客户端密钥配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientKeyConfig {
    /// 客户端密钥
    #[serde(skip_serializing)]
    pub key: String,
    /// 客户端名称
    pub name: String,
    /// 所属分组
    #[serde(default)]
    pub group_id: Option<i64>,
    /// 是否启用
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

/// 内存存储的初始数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    /// 上游账号
    #[serde(default)]
    pub accounts: Vec<AccountRecord>,
    /// 出口代理
    #[serde(default)]
    pub proxies: Vec<Proxy>,
    /// 错误透传规则
    #[serde(default)]
    pub passthrough_rules: Vec<ErrorPassthroughRule>,
}

impl AppConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be greater than 0".to_string());
        }
        if self.server.request_body_limit == 0 {
            return Err("server.request_body_limit must be greater than 0".to_string());
        }
        if self.server.admin_token.as_deref().is_some_and(str::is_empty) {
            return Err("server.admin_token cannot be empty when provided".to_string());
        }

        if self.gateway.max_attempts == 0 {
            return Err("gateway.max_attempts must be at least 1".to_string());
        }
        if self.gateway.stream_channel_capacity == 0 {
            return Err("gateway.stream_channel_capacity must be greater than 0".to_string());
        }
        if self.gateway.response_header_timeout_secs == 0 {
            return Err("gateway.response_header_timeout_secs must be greater than 0".to_string());
        }

        if self.rate_limit.default_cooldown_secs == 0 {
            return Err("rate_limit.default_cooldown_secs must be greater than 0".to_string());
        }
        if self.rate_limit.max_cooldown_secs < self.rate_limit.default_cooldown_secs {
            return Err(
                "rate_limit.max_cooldown_secs cannot be smaller than default_cooldown_secs"
                    .to_string(),
            );
        }

        if self.oauth.client_id.is_empty() || self.oauth.token_url.is_empty() {
            return Err("oauth.client_id and oauth.token_url are required".to_string());
        }
        if self.oauth.refresh_skew_secs < 0 {
            return Err("oauth.refresh_skew_secs cannot be negative".to_string());
        }

        let mut keys = std::collections::HashSet::new();
        for client in &self.clients {
            if client.key.is_empty() {
                return Err(format!("client {} has an empty key", client.name));
            }
            if !keys.insert(client.key.as_str()) {
                return Err(format!("duplicate client key for {}", client.name));
            }
        }

        let mut account_ids = std::collections::HashSet::new();
        for account in &self.seed.accounts {
            if !account_ids.insert(account.id.as_str()) {
                return Err(format!("duplicate account id: {}", account.id));
            }
        }

        for proxy in &self.seed.proxies {
            if !proxy.has_supported_scheme() {
                return Err(format!(
                    "proxy {} has unsupported address: {}",
                    proxy.id, proxy.address
                ));
            }
        }

        Ok(())
    }
}
