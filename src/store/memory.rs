//! # 内存存储
//!
//! 以配置中的种子数据初始化，进程退出后数据丢失

use super::{AccountStore, RuntimeUpdate};
use crate::config::SeedConfig;
use crate::error::{ProxyError, Result};
use crate::passthrough::ErrorPassthroughRule;
use crate::types::{AccountRecord, Proxy};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<String, AccountRecord>,
    proxies: BTreeMap<String, Proxy>,
    rules: BTreeMap<i64, ErrorPassthroughRule>,
}

/// 内存存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// 创建空存储
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用种子数据创建存储
    #[must_use]
    pub fn from_seed(seed: SeedConfig) -> Self {
        let tables = Tables {
            accounts: seed
                .accounts
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
            proxies: seed
                .proxies
                .into_iter()
                .map(|proxy| (proxy.id.clone(), proxy))
                .collect(),
            rules: seed
                .passthrough_rules
                .into_iter()
                .map(|rule| (rule.id, rule))
                .collect(),
        };
        Self {
            tables: RwLock::new(tables),
        }
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn load_accounts(&self) -> Result<Vec<AccountRecord>> {
        Ok(self.tables.read().await.accounts.values().cloned().collect())
    }

    async fn load_account(&self, id: &str) -> Result<Option<AccountRecord>> {
        Ok(self.tables.read().await.accounts.get(id).cloned())
    }

    async fn insert_account(&self, record: AccountRecord) -> Result<AccountRecord> {
        self.tables
            .write()
            .await
            .accounts
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn save_runtime(&self, id: &str, update: RuntimeUpdate) -> Result<AccountRecord> {
        let mut tables = self.tables.write().await;
        let record = tables
            .accounts
            .get_mut(id)
            .filter(|record| !record.deleted)
            .ok_or_else(|| ProxyError::not_found("account", id))?;
        match update {
            RuntimeUpdate::Schedulable(schedulable) => record.schedulable = schedulable,
            RuntimeUpdate::Error(error) => record.last_error = Some(error),
            RuntimeUpdate::ClearError => record.last_error = None,
            RuntimeUpdate::RateLimitedUntil(until) => record.rate_limited_until = Some(until),
            RuntimeUpdate::ClearRateLimit => record.rate_limited_until = None,
            RuntimeUpdate::Credential(credential) => record.credential = credential,
        }
        Ok(record.clone())
    }

    async fn soft_delete_account(&self, id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let record = tables
            .accounts
            .get_mut(id)
            .ok_or_else(|| ProxyError::not_found("account", id))?;
        record.deleted = true;
        Ok(())
    }

    async fn load_proxies(&self) -> Result<Vec<Proxy>> {
        Ok(self.tables.read().await.proxies.values().cloned().collect())
    }

    async fn load_rules(&self) -> Result<Vec<ErrorPassthroughRule>> {
        Ok(self.tables.read().await.rules.values().cloned().collect())
    }

    async fn upsert_rule(&self, mut rule: ErrorPassthroughRule) -> Result<ErrorPassthroughRule> {
        let mut tables = self.tables.write().await;
        if rule.id <= 0 {
            rule.id = tables.rules.keys().next_back().map_or(1, |last| last + 1);
        }
        tables.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn delete_rule(&self, id: i64) -> Result<bool> {
        Ok(self.tables.write().await.rules.remove(&id).is_some())
    }
}
