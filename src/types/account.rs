//! # 上游账号模型
//!
//! `AccountRecord` 是持久化形态，`Account` 是账号池使用的运行时形态。
//! 记录在写入账号池时完成一次性归一化（历史 `upstream` 类型收敛为 `apikey`）。

use super::{AccountId, GroupId, ProxyId};
use crate::error::{ProxyError, Result};
use crate::provider::ModelRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Anthropic 官方 API 地址
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// 上游平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Anthropic Claude
    Anthropic,
    /// Antigravity
    Antigravity,
    /// Google Gemini
    Gemini,
    /// `OpenAI`
    OpenAI,
}

impl Platform {
    /// 转换为字符串
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Antigravity => "antigravity",
            Self::Gemini => "gemini",
            Self::OpenAI => "openai",
        }
    }

    /// 平台默认的上游地址
    #[must_use]
    pub const fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::Anthropic => Some(ANTHROPIC_BASE_URL),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "antigravity" => Ok(Self::Antigravity),
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAI),
            _ => Err(format!("Unknown platform: {s}")),
        }
    }
}

/// 账号凭证类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountKind {
    /// 直接使用 API Key
    #[serde(rename = "apikey")]
    ApiKey,
    /// OAuth 会话（access token + refresh token）
    #[serde(rename = "oauth-session")]
    OAuthSession,
}

impl AccountKind {
    /// 转换为字符串
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "apikey",
            Self::OAuthSession => "oauth-session",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 持久化记录中的账号类型，包含历史遗留的 `upstream`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    /// API Key
    #[serde(rename = "apikey")]
    ApiKey,
    /// OAuth 会话
    #[serde(rename = "oauth-session")]
    OAuthSession,
    /// 指向兼容服务的旧类型
    #[serde(rename = "upstream")]
    Upstream,
}

/// OAuth 令牌
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// 访问令牌
    pub access_token: String,
    /// 刷新令牌（setup token 没有）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// 过期时间
    pub expires_at: DateTime<Utc>,
    /// 授权范围
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// 账号凭证
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// API Key
    ApiKey {
        /// 密钥
        api_key: String,
    },
    /// OAuth 令牌
    #[serde(rename = "oauth")]
    OAuth(OAuthTokens),
}

impl Credential {
    /// 凭证对应的账号类型
    #[must_use]
    pub const fn kind(&self) -> AccountKind {
        match self {
            Self::ApiKey { .. } => AccountKind::ApiKey,
            Self::OAuth(_) => AccountKind::OAuthSession,
        }
    }

    /// 用于上游调用的密钥或访问令牌
    #[must_use]
    pub fn secret(&self) -> &str {
        match self {
            Self::ApiKey { api_key } => api_key,
            Self::OAuth(tokens) => &tokens.access_token,
        }
    }

    /// OAuth 令牌
    #[must_use]
    pub const fn oauth(&self) -> Option<&OAuthTokens> {
        match self {
            Self::OAuth(tokens) => Some(tokens),
            Self::ApiKey { .. } => None,
        }
    }
}

/// 账号最近一次错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountError {
    /// 错误描述
    pub message: String,
    /// 发生时间
    pub at: DateTime<Utc>,
}

/// 账号持久化记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    /// 账号ID
    pub id: AccountId,
    /// 显示名称
    #[serde(default)]
    pub name: String,
    /// 平台
    pub platform: Platform,
    /// 类型
    pub kind: RecordKind,
    /// 上游地址
    #[serde(default)]
    pub base_url: Option<String>,
    /// 凭证
    pub credential: Credential,
    /// 绑定的代理
    #[serde(default)]
    pub proxy_id: Option<ProxyId>,
    /// 所属分组，空表示不限
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    /// 支持的模型，空表示全部；末尾 `*` 表示前缀匹配
    #[serde(default)]
    pub supported_models: Vec<String>,
    /// 是否参与调度
    #[serde(default = "default_true")]
    pub schedulable: bool,
    /// 限流截止时间
    #[serde(default)]
    pub rate_limited_until: Option<DateTime<Utc>>,
    /// 最近错误
    #[serde(default)]
    pub last_error: Option<AccountError>,
    /// 软删除标记
    #[serde(default)]
    pub deleted: bool,
}

const fn default_true() -> bool {
    true
}

/// 运行时账号
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// 账号ID
    pub id: AccountId,
    /// 显示名称
    pub name: String,
    /// 平台
    pub platform: Platform,
    /// 类型
    pub kind: AccountKind,
    /// 上游地址
    pub base_url: String,
    /// 凭证
    pub credential: Credential,
    /// 绑定的代理
    pub proxy_id: Option<ProxyId>,
    /// 所属分组
    pub group_ids: Vec<GroupId>,
    /// 支持的模型
    pub supported_models: Vec<String>,
    /// 是否参与调度
    pub schedulable: bool,
    /// 限流截止时间
    pub rate_limited_until: Option<DateTime<Utc>>,
    /// 最近错误
    pub last_error: Option<AccountError>,
    /// 最近使用时间
    pub last_used_at: Option<DateTime<Utc>>,
    /// 连续网络失败次数
    pub transport_failures: u32,
}

impl Account {
    /// 从持久化记录构建运行时账号，完成类型归一化
    pub fn from_record(record: AccountRecord) -> Result<Self> {
        let base_url = record
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| url.trim_end_matches('/').to_string());

        let kind = match record.kind {
            RecordKind::ApiKey => AccountKind::ApiKey,
            RecordKind::OAuthSession => AccountKind::OAuthSession,
            // 旧的 upstream 类型：只要指向了实现转发协议的地址，就等价于 apikey
            RecordKind::Upstream => {
                if base_url.is_none() {
                    return Err(ProxyError::business(format!(
                        "account {} has legacy upstream kind without base_url",
                        record.id
                    )));
                }
                AccountKind::ApiKey
            }
        };

        if record.credential.kind() != kind {
            return Err(ProxyError::business(format!(
                "account {} credential does not match kind {kind}",
                record.id
            )));
        }

        let base_url = match base_url {
            Some(url) => url,
            None => record
                .platform
                .default_base_url()
                .map(str::to_string)
                .ok_or_else(|| {
                    ProxyError::business(format!(
                        "account {} on platform {} requires base_url",
                        record.id, record.platform
                    ))
                })?,
        };

        Ok(Self {
            name: if record.name.is_empty() {
                record.id.clone()
            } else {
                record.name
            },
            id: record.id,
            platform: record.platform,
            kind,
            base_url,
            credential: record.credential,
            proxy_id: record.proxy_id,
            group_ids: record.group_ids,
            supported_models: record.supported_models,
            schedulable: record.schedulable,
            rate_limited_until: record.rate_limited_until,
            last_error: record.last_error,
            last_used_at: None,
            transport_failures: 0,
        })
    }

    /// 转回持久化记录
    #[must_use]
    pub fn to_record(&self) -> AccountRecord {
        let kind = match self.kind {
            AccountKind::ApiKey => RecordKind::ApiKey,
            AccountKind::OAuthSession => RecordKind::OAuthSession,
        };
        AccountRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            platform: self.platform,
            kind,
            base_url: Some(self.base_url.clone()),
            credential: self.credential.clone(),
            proxy_id: self.proxy_id.clone(),
            group_ids: self.group_ids.clone(),
            supported_models: self.supported_models.clone(),
            schedulable: self.schedulable,
            rate_limited_until: self.rate_limited_until,
            last_error: self.last_error.clone(),
            deleted: false,
        }
    }

    /// 账号是否支持指定模型
    ///
    /// 模型与配置的模式都按短名和上游ID两种形式比较。
    #[must_use]
    pub fn supports_model(&self, model: &str) -> bool {
        if self.supported_models.is_empty() {
            return true;
        }
        let registry = ModelRegistry::global();
        let forms = [registry.normalize(model), registry.denormalize(model)];
        self.supported_models.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => forms.iter().any(|form| form.starts_with(prefix)),
            None => {
                let pattern = pattern.as_str();
                let pattern_forms = [registry.normalize(pattern), registry.denormalize(pattern)];
                forms.iter().any(|form| pattern_forms.contains(form))
            }
        })
    }

    /// 在 `now` 时刻是否处于限流中
    #[must_use]
    pub fn is_rate_limited_at(&self, now: DateTime<Utc>) -> bool {
        self.rate_limited_until.is_some_and(|until| now < until)
    }

    /// 生成管理端视图（不含凭证）
    #[must_use]
    pub fn snapshot(&self, now: DateTime<Utc>) -> AccountSnapshot {
        AccountSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            platform: self.platform,
            kind: self.kind,
            base_url: self.base_url.clone(),
            proxy_id: self.proxy_id.clone(),
            schedulable: self.schedulable,
            rate_limited: self.is_rate_limited_at(now),
            rate_limited_until: self.rate_limited_until,
            last_error: self.last_error.clone(),
            last_used_at: self.last_used_at,
            token_expires_at: self.credential.oauth().map(|tokens| tokens.expires_at),
        }
    }
}

/// 账号运行时视图
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    /// 账号ID
    pub id: AccountId,
    /// 显示名称
    pub name: String,
    /// 平台
    pub platform: Platform,
    /// 类型
    pub kind: AccountKind,
    /// 上游地址
    pub base_url: String,
    /// 绑定的代理
    pub proxy_id: Option<ProxyId>,
    /// 是否参与调度
    pub schedulable: bool,
    /// 当前是否限流
    pub rate_limited: bool,
    /// 限流截止时间
    pub rate_limited_until: Option<DateTime<Utc>>,
    /// 最近错误
    pub last_error: Option<AccountError>,
    /// 最近使用时间
    pub last_used_at: Option<DateTime<Utc>>,
    /// OAuth 令牌过期时间
    pub token_expires_at: Option<DateTime<Utc>>,
}
