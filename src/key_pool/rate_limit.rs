//! # 限流冷却跟踪
//!
//! `Healthy` / `RateLimited(until)` 两态。上游返回限流信号时进入冷却，
//! 冷却在选择账号时惰性过期，管理员可随时强制解除。状态只用于调度，不作为审计记录。

use super::pool_manager::AccountPool;
use super::types::RateLimitState;
use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{linfo, lwarn};
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::sync::Arc;

/// Anthropic 统一限流重置时间（unix 秒）
pub const UNIFIED_RESET_HEADER: &str = "anthropic-ratelimit-unified-reset";

/// 上游响应是否表示限流
#[must_use]
pub fn is_rate_limit_signal(status: u16, body: &[u8]) -> bool {
    if status == 429 {
        return true;
    }
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/type")
                .and_then(serde_json::Value::as_str)
                .map(|kind| kind == "rate_limit_error")
        })
        .unwrap_or(false)
}

/// 从响应头解析重试提示
#[must_use]
pub fn retry_hint(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(value) = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<i64>() {
            return Duration::try_seconds(seconds).and_then(|wait| now.checked_add_signed(wait));
        }
        if let Ok(date) = DateTime::parse_from_rfc2822(value) {
            return Some(date.with_timezone(&Utc));
        }
    }

    headers
        .get(UNIFIED_RESET_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
}

fn seconds(value: u64) -> Duration {
    Duration::try_seconds(i64::try_from(value).unwrap_or(i64::MAX)).unwrap_or(Duration::MAX)
}

/// 限流冷却跟踪器
pub struct RateLimitTracker {
    pool: Arc<AccountPool>,
    config: RateLimitConfig,
}

impl RateLimitTracker {
    /// 创建跟踪器
    #[must_use]
    pub const fn new(pool: Arc<AccountPool>, config: RateLimitConfig) -> Self {
        Self { pool, config }
    }

    /// 计算冷却截止时间：有提示用提示，否则默认冷却，最终限制在上限内
    #[must_use]
    pub fn cooldown_until(&self, headers: &HeaderMap, now: DateTime<Utc>) -> DateTime<Utc> {
        let max = seconds(self.config.max_cooldown_secs);
        let wait = retry_hint(headers, now)
            .map(|until| until - now)
            .filter(|wait| *wait > Duration::zero())
            .unwrap_or_else(|| seconds(self.config.default_cooldown_secs));
        now.checked_add_signed(wait.min(max))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// 观察上游响应；是限流信号时进入冷却并返回截止时间
    pub async fn observe(
        &self,
        request_id: &str,
        account_id: &str,
        status: u16,
        headers: &HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        if !is_rate_limit_signal(status, body) {
            return Ok(None);
        }
        let until = self.cooldown_until(headers, now);
        let effective = self.pool.set_rate_limited(account_id, until).await?;
        lwarn!(
            request_id,
            LogStage::ErrorHandling,
            LogComponent::RateLimiter,
            "account_rate_limited",
            "账号被上游限流，进入冷却",
            account_id = %account_id,
            status = status,
            until = %effective
        );
        Ok(Some(effective))
    }

    /// 管理员强制解除冷却
    pub async fn clear(&self, account_id: &str) -> Result<()> {
        self.pool.clear_rate_limit(account_id).await?;
        linfo!(
            "system",
            LogStage::Management,
            LogComponent::RateLimiter,
            "rate_limit_cleared",
            "已手动解除账号冷却",
            account_id = %account_id
        );
        Ok(())
    }

    /// 当前状态
    pub async fn state(&self, account_id: &str, now: DateTime<Utc>) -> Result<RateLimitState> {
        self.pool.rate_limit_state(account_id, now).await
    }
}
