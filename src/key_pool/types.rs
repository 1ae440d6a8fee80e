//! # 账号调度类型定义

use crate::types::{Account, AccountId, GroupId, Platform, Proxy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// 账号选择条件
#[derive(Debug, Clone)]
pub struct SelectionCriteria {
    /// 请求ID
    pub request_id: String,
    /// 目标平台
    pub platform: Platform,
    /// 请求的上游模型，`None` 表示不限
    pub model: Option<String>,
    /// 调用方所属分组
    pub group_id: Option<GroupId>,
    /// 本次请求已尝试过的账号
    pub exclude: HashSet<AccountId>,
}

impl SelectionCriteria {
    /// 创建选择条件
    pub fn new(request_id: impl Into<String>, platform: Platform) -> Self {
        Self {
            request_id: request_id.into(),
            platform,
            model: None,
            group_id: None,
            exclude: HashSet::new(),
        }
    }

    /// 限定模型
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// 限定分组
    #[must_use]
    pub const fn with_group(mut self, group_id: Option<GroupId>) -> Self {
        self.group_id = group_id;
        self
    }

    /// 账号的分组范围是否覆盖调用方
    pub(crate) fn group_allows(&self, account: &Account) -> bool {
        account.group_ids.is_empty()
            || self
                .group_id
                .is_some_and(|group_id| account.group_ids.contains(&group_id))
    }

    /// 账号能力是否覆盖请求
    pub(crate) fn capability_allows(&self, account: &Account) -> bool {
        self.model
            .as_deref()
            .is_none_or(|model| account.supports_model(model))
    }
}

/// 选中的账号与出口
#[derive(Debug, Clone)]
pub struct Selection {
    /// 账号（选中时刻的快照）
    pub account: Account,
    /// 绑定的代理，`None` 表示直连
    pub proxy: Option<Proxy>,
}

/// 账号的限流状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RateLimitState {
    /// 可用
    Healthy,
    /// 冷却中
    RateLimited {
        /// 冷却截止时间
        until: DateTime<Utc>,
    },
}

impl RateLimitState {
    /// 根据截止时间与当前时间得出状态
    #[must_use]
    pub fn at(until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match until {
            Some(until) if now < until => Self::RateLimited { until },
            _ => Self::Healthy,
        }
    }
}

impl fmt::Display for RateLimitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::RateLimited { until } => write!(f, "rate_limited(until={until})"),
        }
    }
}

/// 账号池统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// 账号总数
    pub total: usize,
    /// 可调度账号数
    pub schedulable: usize,
    /// 冷却中账号数
    pub rate_limited: usize,
    /// 有错误记录的账号数
    pub errored: usize,
    /// 代理数
    pub proxies: usize,
}
