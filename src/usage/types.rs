//! 用量记录使用的类型

use crate::types::AccountId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// token 计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// 输入 token
    pub input_tokens: u64,
    /// 输出 token
    pub output_tokens: u64,
    /// 写入缓存的输入 token
    pub cache_creation_input_tokens: u64,
    /// 命中缓存的输入 token
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    /// 用 Claude `usage` 对象中出现的字段覆盖当前值
    pub fn merge_from(&mut self, usage: &Value) {
        let field = |name: &str| usage.get(name).and_then(Value::as_u64);
        if let Some(v) = field("input_tokens") {
            self.input_tokens = v;
        }
        if let Some(v) = field("output_tokens") {
            self.output_tokens = v;
        }
        if let Some(v) = field("cache_creation_input_tokens") {
            self.cache_creation_input_tokens = v;
        }
        if let Some(v) = field("cache_read_input_tokens") {
            self.cache_read_input_tokens = v;
        }
    }

    /// 累加
    pub fn add(&mut self, other: &Self) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .saturating_add(other.cache_creation_input_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .saturating_add(other.cache_read_input_tokens);
    }

    /// 合计
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_creation_input_tokens)
            .saturating_add(self.cache_read_input_tokens)
    }
}

/// 请求结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsageOutcome {
    /// 上游成功
    Success,
    /// 上游返回非 2xx
    UpstreamError {
        /// 上游状态码
        status: u16,
    },
    /// 网络失败
    TransportError,
    /// 客户端中途断开
    Cancelled,
    /// 没有可用账号或凭证
    Unavailable,
}

impl UsageOutcome {
    /// 是否成功
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// 一次转发完成后的用量记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub client_id: String,
    pub account_id: Option<AccountId>,
    pub model: String,
    pub usage: TokenUsage,
    pub outcome: UsageOutcome,
    pub stream: bool,
    pub at: DateTime<Utc>,
}

/// 单个客户端的累计用量
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientUsage {
    pub client_id: String,
    pub requests: u64,
    pub failed_requests: u64,
    pub totals: TokenUsage,
    pub by_model: BTreeMap<String, TokenUsage>,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl ClientUsage {
    /// 计入一条记录
    pub fn apply(&mut self, record: &UsageRecord) {
        self.requests += 1;
        if !record.outcome.is_success() {
            self.failed_requests += 1;
        }
        self.totals.add(&record.usage);
        self.by_model
            .entry(record.model.clone())
            .or_default()
            .add(&record.usage);
        self.last_request_at = Some(
            self.last_request_at
                .map_or(record.at, |last| last.max(record.at)),
        );
    }
}
