//! # 持久化接口
//!
//! 账号、代理与错误透传规则的数据来源。账号池缓存这里的数据，
//! 管理端操作后从这里重新读取。

mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::passthrough::ErrorPassthroughRule;
use crate::types::{AccountError, AccountRecord, Credential, Proxy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 账号运行时字段的写回
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeUpdate {
    /// 切换可调度
    Schedulable(bool),
    /// 记录错误
    Error(AccountError),
    /// 清除错误
    ClearError,
    /// 设置冷却截止时间
    RateLimitedUntil(DateTime<Utc>),
    /// 清除冷却
    ClearRateLimit,
    /// 新凭证（令牌刷新后）
    Credential(Credential),
}

/// 账号存储
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// 全部账号（包含已软删除的记录）
    async fn load_accounts(&self) -> Result<Vec<AccountRecord>>;

    /// 单个账号
    async fn load_account(&self, id: &str) -> Result<Option<AccountRecord>>;

    /// 新增或覆盖账号
    async fn insert_account(&self, record: AccountRecord) -> Result<AccountRecord>;

    /// 写回运行时字段
    async fn save_runtime(&self, id: &str, update: RuntimeUpdate) -> Result<AccountRecord>;

    /// 软删除账号
    async fn soft_delete_account(&self, id: &str) -> Result<()>;

    /// 全部代理
    async fn load_proxies(&self) -> Result<Vec<Proxy>>;

    /// 全部错误透传规则
    async fn load_rules(&self) -> Result<Vec<ErrorPassthroughRule>>;

    /// 新增或更新规则；`id <= 0` 时分配新ID
    async fn upsert_rule(&self, rule: ErrorPassthroughRule) -> Result<ErrorPassthroughRule>;

    /// 删除规则，返回是否存在
    async fn delete_rule(&self, id: i64) -> Result<bool>;
}
