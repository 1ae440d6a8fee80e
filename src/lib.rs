//! # API Relay
//!
//! Claude 兼容网关核心库：在上游账号池上复用客户端流量，
//! 负责账号调度、凭证刷新、限流冷却、错误透传与流式中继。

pub mod auth;
pub mod config;
pub mod error;
pub mod gate;
pub mod key_pool;
pub mod logging;
pub mod management;
pub mod passthrough;
pub mod provider;
pub mod proxy;
pub mod store;
pub mod types;
pub mod usage;
pub mod utils;

// Re-export commonly used types
pub use config::{AppConfig, ConfigManager};
pub use error::{ProxyError, Result};
pub use proxy::AppState;
