//! # 错误透传引擎
//!
//! 规则按 (priority, id) 升序排成唯一的全序，第一条匹配的规则生效。
//! 规则集整体替换，下一次评估即可看到新规则。

use super::rules::{ErrorPassthroughRule, UpstreamFailure};
use crate::error::error_body;
use crate::logging::{LogComponent, LogStage};
use crate::ldebug;
use axum::http::StatusCode;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 未匹配任何规则时返回的消息
pub const DEFAULT_ERROR_MESSAGE: &str = "Internal server error";
/// 规则未配置自定义消息时返回的消息
pub const DEFAULT_CUSTOM_MESSAGE: &str = "Upstream request failed";

/// 客户端最终看到的错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassthroughDecision {
    /// 返回给客户端的状态码
    pub status: StatusCode,
    /// 返回给客户端的响应体
    pub body: Bytes,
    /// 是否沿用了上游状态码
    pub code_passthrough: bool,
    /// 是否原样返回了上游响应体
    pub body_passthrough: bool,
    /// 命中的规则
    pub rule_id: Option<i64>,
}

impl PassthroughDecision {
    /// 默认策略：通用内部错误，不泄露上游细节
    #[must_use]
    pub fn generic() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json_bytes(&error_body("api_error", DEFAULT_ERROR_MESSAGE)),
            code_passthrough: false,
            body_passthrough: false,
            rule_id: None,
        }
    }

    fn from_rule(rule: &ErrorPassthroughRule, failure: &UpstreamFailure<'_>) -> Self {
        let upstream_status = StatusCode::from_u16(failure.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let status = if rule.passthrough_code {
            upstream_status
        } else {
            rule.response_code
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(upstream_status)
        };

        let body = if rule.passthrough_body {
            Bytes::copy_from_slice(failure.body)
        } else {
            let message = rule
                .custom_message
                .as_deref()
                .filter(|message| !message.is_empty())
                .unwrap_or(DEFAULT_CUSTOM_MESSAGE);
            json_bytes(&error_body("upstream_error", message))
        };

        Self {
            status,
            body,
            code_passthrough: rule.passthrough_code,
            body_passthrough: rule.passthrough_body,
            rule_id: Some(rule.id),
        }
    }
}

fn json_bytes(value: &serde_json::Value) -> Bytes {
    Bytes::from(value.to_string())
}

/// 按评估顺序排列规则
#[must_use]
pub fn ordered(mut rules: Vec<ErrorPassthroughRule>) -> Vec<ErrorPassthroughRule> {
    rules.sort_by_key(ErrorPassthroughRule::order_key);
    rules
}

/// 在有序规则集上找到第一条匹配规则
#[must_use]
pub fn first_match<'r>(
    rules: &'r [ErrorPassthroughRule],
    failure: &UpstreamFailure<'_>,
) -> Option<&'r ErrorPassthroughRule> {
    rules.iter().find(|rule| rule.matches(failure))
}

/// 错误透传引擎
#[derive(Debug, Default)]
pub struct ErrorPassthroughEngine {
    rules: RwLock<Arc<Vec<ErrorPassthroughRule>>>,
}

impl ErrorPassthroughEngine {
    /// 使用给定规则集创建引擎
    #[must_use]
    pub fn new(rules: Vec<ErrorPassthroughRule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(ordered(rules))),
        }
    }

    /// 整体替换规则集
    pub async fn replace_rules(&self, rules: Vec<ErrorPassthroughRule>) {
        let rules = Arc::new(ordered(rules));
        ldebug!(
            "system",
            LogStage::Management,
            LogComponent::Passthrough,
            "replace_rules",
            "错误透传规则已更新",
            count = rules.len()
        );
        *self.rules.write().await = rules;
    }

    /// 当前规则集（评估顺序）
    pub async fn rules(&self) -> Arc<Vec<ErrorPassthroughRule>> {
        Arc::clone(&*self.rules.read().await)
    }

    /// 仅在有规则命中时给出决定
    pub async fn evaluate(&self, failure: &UpstreamFailure<'_>) -> Option<PassthroughDecision> {
        let rules = self.rules().await;
        first_match(&rules, failure).map(|rule| PassthroughDecision::from_rule(rule, failure))
    }

    /// 决定客户端看到的错误，未命中时使用默认策略
    pub async fn decide(&self, failure: &UpstreamFailure<'_>) -> PassthroughDecision {
        self.evaluate(failure)
            .await
            .unwrap_or_else(PassthroughDecision::generic)
    }
}
