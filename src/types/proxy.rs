//! # 出口代理模型

use super::ProxyId;
use serde::{Deserialize, Serialize};
use url::Url;

/// 代理健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    /// 可用
    #[default]
    Active,
    /// 最近一次使用出错
    Error,
}

/// 出口代理
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    /// 代理ID
    pub id: ProxyId,
    /// 显示名称
    #[serde(default)]
    pub name: String,
    /// 代理地址，如 `http://10.0.0.1:8080`、`socks5://10.0.0.2:1080`
    pub address: String,
    /// 认证用户名
    #[serde(default)]
    pub username: Option<String>,
    /// 认证密码
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// 健康状态
    #[serde(default)]
    pub status: ProxyStatus,
    /// 最近错误
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Proxy {
    /// 代理协议是否受支持
    #[must_use]
    pub fn has_supported_scheme(&self) -> bool {
        Url::parse(&self.address).is_ok_and(|url| {
            matches!(url.scheme(), "http" | "https" | "socks5" | "socks5h")
        })
    }
}
