//! # 日志配置模块
//!
//! 提供统一的日志初始化，以及带请求ID、阶段、组件和操作名的结构化日志宏

use std::env;
use std::fmt;
use tracing_subscriber::{EnvFilter, fmt as subscriber_fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 日志阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStage {
    /// 服务启动
    Startup,
    /// 服务关闭
    Shutdown,
    /// 配置加载
    Configuration,
    /// 客户端认证
    Authentication,
    /// 账号调度
    Scheduling,
    /// 凭证刷新
    CredentialRefresh,
    /// 请求转发
    RequestForward,
    /// 响应流转发
    ResponseStream,
    /// 错误处理
    ErrorHandling,
    /// 用量记录
    Usage,
    /// 管理操作
    Management,
}

impl LogStage {
    /// 转换为字符串
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Configuration => "configuration",
            Self::Authentication => "authentication",
            Self::Scheduling => "scheduling",
            Self::CredentialRefresh => "credential_refresh",
            Self::RequestForward => "request_forward",
            Self::ResponseStream => "response_stream",
            Self::ErrorHandling => "error_handling",
            Self::Usage => "usage",
            Self::Management => "management",
        }
    }
}

impl fmt::Display for LogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 日志组件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogComponent {
    /// 主程序
    Main,
    /// 配置管理
    Config,
    /// 账号池
    KeyPool,
    /// 限流跟踪
    RateLimiter,
    /// OAuth 凭证
    OAuth,
    /// 请求头组装
    HeaderComposer,
    /// 模型映射
    ModelRegistry,
    /// 上游转发
    Forwarder,
    /// 流式转发
    StreamRelay,
    /// 错误透传规则
    Passthrough,
    /// 网关入口
    Gateway,
    /// 客户端准入
    ClientGate,
    /// 用量记录
    Usage,
    /// 管理接口
    Management,
    /// 持久化
    Store,
}

impl LogComponent {
    /// 转换为字符串
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Config => "config",
            Self::KeyPool => "key_pool",
            Self::RateLimiter => "rate_limiter",
            Self::OAuth => "oauth",
            Self::HeaderComposer => "header_composer",
            Self::ModelRegistry => "model_registry",
            Self::Forwarder => "forwarder",
            Self::StreamRelay => "stream_relay",
            Self::Passthrough => "passthrough",
            Self::Gateway => "gateway",
            Self::ClientGate => "client_gate",
            Self::Usage => "usage",
            Self::Management => "management",
            Self::Store => "store",
        }
    }
}

impl fmt::Display for LogComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// INFO 级结构化日志
#[macro_export]
macro_rules! linfo {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($field:tt)+)?) => {
        ::tracing::info!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            $($($field)+,)?
            "{}",
            $message
        )
    };
}

/// DEBUG 级结构化日志
#[macro_export]
macro_rules! ldebug {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($field:tt)+)?) => {
        ::tracing::debug!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            $($($field)+,)?
            "{}",
            $message
        )
    };
}

/// WARN 级结构化日志
#[macro_export]
macro_rules! lwarn {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($field:tt)+)?) => {
        ::tracing::warn!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            $($($field)+,)?
            "{}",
            $message
        )
    };
}

/// ERROR 级结构化日志
#[macro_export]
macro_rules! lerror {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($field:tt)+)?) => {
        ::tracing::error!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            $($($field)+,)?
            "{}",
            $message
        )
    };
}

/// 凭证脱敏，只保留首尾少量字符
#[must_use]
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{head}…{tail}")
}

/// 初始化日志系统
pub fn init_optimized_logging(log_level: Option<&String>) {
    let level = log_level.map_or("info", String::as_str);

    let default_filter = format!("{level},api_relay=debug,hyper=warn,reqwest=warn");
    let log_filter = env::var("RUST_LOG").unwrap_or(default_filter);

    let result = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .with(
            subscriber_fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed, skipping");
    }
}
