//! # 账号池管理器
//!
//! 账号运行时字段（可调度、限流截止、最近使用、凭证、错误）的唯一同步访问入口。
//! 所有读改写都在同一把锁内完成，选择与标记使用是一个原子操作。

use super::types::{PoolStats, RateLimitState, Selection, SelectionCriteria};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::types::{
    Account, AccountError, AccountId, AccountRecord, AccountSnapshot, Credential, Proxy, ProxyId,
};
use crate::{ldebug, linfo, lwarn};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// 池中的账号条目
#[derive(Debug, Clone)]
struct PoolEntry {
    account: Account,
    /// 最近一次被选中的序号，0 表示从未使用
    use_seq: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    accounts: HashMap<AccountId, PoolEntry>,
    proxies: HashMap<ProxyId, Proxy>,
    /// 单调递增的选择序号
    seq: u64,
}

impl PoolState {
    fn entry_mut(&mut self, account_id: &str) -> Result<&mut PoolEntry> {
        self.accounts
            .get_mut(account_id)
            .ok_or_else(|| ProxyError::not_found("account", account_id))
    }
}

/// 账号池
#[derive(Debug, Default)]
pub struct AccountPool {
    state: RwLock<PoolState>,
}

impl AccountPool {
    /// 创建空账号池
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 用持久化数据整体重建账号池，保留已有账号的运行时状态
    pub async fn load(&self, records: Vec<AccountRecord>, proxies: Vec<Proxy>) -> Result<usize> {
        let mut accounts = HashMap::with_capacity(records.len());
        for record in records.into_iter().filter(|record| !record.deleted) {
            let account = Account::from_record(record)?;
            accounts.insert(account.id.clone(), account);
        }

        let mut state = self.state.write().await;
        let previous = std::mem::take(&mut state.accounts);
        state.accounts = accounts
            .into_iter()
            .map(|(id, account)| {
                let entry = match previous.get(&id) {
                    Some(old) => merge_runtime(old, account),
                    None => PoolEntry {
                        account,
                        use_seq: 0,
                    },
                };
                (id, entry)
            })
            .collect();
        state.proxies = proxies
            .into_iter()
            .map(|proxy| (proxy.id.clone(), proxy))
            .collect();

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::KeyPool,
            "pool_loaded",
            "账号池已加载",
            accounts = state.accounts.len(),
            proxies = state.proxies.len()
        );
        Ok(state.accounts.len())
    }

    /// 写入单个账号记录；已软删除的记录立即从池中移除
    pub async fn upsert(&self, record: AccountRecord) -> Result<()> {
        if record.deleted {
            self.remove(&record.id).await;
            return Ok(());
        }
        let account = Account::from_record(record)?;
        let mut state = self.state.write().await;
        let entry = match state.accounts.get(&account.id) {
            Some(old) => merge_runtime(old, account),
            None => PoolEntry {
                account,
                use_seq: 0,
            },
        };
        state.accounts.insert(entry.account.id.clone(), entry);
        Ok(())
    }

    /// 移除账号，之后的选择不会再返回它
    pub async fn remove(&self, account_id: &str) -> bool {
        let removed = self.state.write().await.accounts.remove(account_id).is_some();
        if removed {
            linfo!(
                "system",
                LogStage::Management,
                LogComponent::KeyPool,
                "account_removed",
                "账号已从池中移除",
                account_id = %account_id
            );
        }
        removed
    }

    /// 选择一个可用账号并在同一临界区内标记为最近使用
    ///
    /// 过滤：可调度、平台一致、不在冷却中（惰性检查过期）、能力覆盖、分组允许、未被排除。
    /// 排序：最近使用序号升序，再按账号ID升序。
    pub async fn select_and_mark_used(
        &self,
        criteria: &SelectionCriteria,
        now: DateTime<Utc>,
    ) -> Result<Selection> {
        let mut state = self.state.write().await;

        let mut best: Option<(u64, &AccountId)> = None;
        let mut expired = Vec::new();
        for (id, entry) in &state.accounts {
            let account = &entry.account;
            if !account.schedulable
                || account.platform != criteria.platform
                || criteria.exclude.contains(id)
                || !criteria.capability_allows(account)
                || !criteria.group_allows(account)
            {
                continue;
            }
            match account.rate_limited_until {
                Some(until) if now < until => continue,
                Some(_) => expired.push(id.clone()),
                None => {}
            }
            let key = (entry.use_seq, id);
            if best.is_none_or(|current| key < current) {
                best = Some(key);
            }
        }
        let chosen = best.map(|(_, id)| id.clone());

        for id in expired {
            if let Some(entry) = state.accounts.get_mut(&id) {
                entry.account.rate_limited_until = None;
                ldebug!(
                    &criteria.request_id,
                    LogStage::Scheduling,
                    LogComponent::RateLimiter,
                    "cooldown_expired",
                    "账号冷却已结束，恢复调度",
                    account_id = %id
                );
            }
        }

        let Some(chosen) = chosen else {
            lwarn!(
                &criteria.request_id,
                LogStage::Scheduling,
                LogComponent::KeyPool,
                "no_eligible_account",
                "没有可调度的账号",
                platform = %criteria.platform,
                model = ?criteria.model,
                excluded = criteria.exclude.len()
            );
            return Err(ProxyError::no_eligible_account(format!(
                "no schedulable {} account available",
                criteria.platform
            )));
        };

        state.seq += 1;
        let seq = state.seq;
        let entry = state.entry_mut(&chosen)?;
        entry.use_seq = seq;
        entry.account.last_used_at = Some(now);
        let account = entry.account.clone();

        let proxy = match account.proxy_id.as_deref() {
            Some(proxy_id) => {
                let proxy = state.proxies.get(proxy_id).cloned();
                if proxy.is_none() {
                    lwarn!(
                        &criteria.request_id,
                        LogStage::Scheduling,
                        LogComponent::KeyPool,
                        "proxy_missing",
                        "账号绑定的代理不存在，改为直连",
                        account_id = %account.id,
                        proxy_id = %proxy_id
                    );
                }
                proxy
            }
            None => None,
        };

        ldebug!(
            &criteria.request_id,
            LogStage::Scheduling,
            LogComponent::KeyPool,
            "account_selected",
            "已选择账号",
            account_id = %account.id,
            kind = %account.kind,
            proxy = ?proxy.as_ref().map(|p| p.id.as_str())
        );

        Ok(Selection { account, proxy })
    }

    /// 设置冷却截止时间，已有更晚的截止时间时保留更晚者
    pub async fn set_rate_limited(
        &self,
        account_id: &str,
        until: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let mut state = self.state.write().await;
        let entry = state.entry_mut(account_id)?;
        let effective = entry
            .account
            .rate_limited_until
            .map_or(until, |current| current.max(until));
        entry.account.rate_limited_until = Some(effective);
        Ok(effective)
    }

    /// 立即解除冷却
    pub async fn clear_rate_limit(&self, account_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.entry_mut(account_id)?.account.rate_limited_until = None;
        Ok(())
    }

    /// 当前限流状态（不修改状态）
    pub async fn rate_limit_state(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitState> {
        let state = self.state.read().await;
        let entry = state
            .accounts
            .get(account_id)
            .ok_or_else(|| ProxyError::not_found("account", account_id))?;
        Ok(RateLimitState::at(entry.account.rate_limited_until, now))
    }

    /// 替换账号凭证
    pub async fn update_credential(&self, account_id: &str, credential: Credential) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state.entry_mut(account_id)?;
        if entry.account.kind != credential.kind() {
            return Err(ProxyError::business(format!(
                "credential kind {} does not match account {}",
                credential.kind(),
                account_id
            )));
        }
        entry.account.credential = credential;
        Ok(())
    }

    /// 记录账号错误
    pub async fn set_last_error(
        &self,
        account_id: &str,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.entry_mut(account_id)?.account.last_error = Some(AccountError {
            message: message.into(),
            at,
        });
        Ok(())
    }

    /// 清除错误记录与网络失败计数
    pub async fn clear_error(&self, account_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state.entry_mut(account_id)?;
        entry.account.last_error = None;
        entry.account.transport_failures = 0;
        Ok(())
    }

    /// 切换是否参与调度
    pub async fn set_schedulable(&self, account_id: &str, schedulable: bool) -> Result<()> {
        let mut state = self.state.write().await;
        state.entry_mut(account_id)?.account.schedulable = schedulable;
        Ok(())
    }

    /// 记录一次网络失败，连续达到阈值时写入错误记录；返回当前连续失败次数
    pub async fn record_transport_failure(
        &self,
        account_id: &str,
        message: &str,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let mut state = self.state.write().await;
        let entry = state.entry_mut(account_id)?;
        entry.account.transport_failures = entry.account.transport_failures.saturating_add(1);
        let failures = entry.account.transport_failures;
        if threshold > 0 && failures >= threshold {
            entry.account.last_error = Some(AccountError {
                message: format!("{failures} consecutive transport failures: {message}"),
                at: now,
            });
        }
        Ok(failures)
    }

    /// 请求成功后重置网络失败计数
    pub async fn record_success(&self, account_id: &str) {
        if let Some(entry) = self.state.write().await.accounts.get_mut(account_id) {
            entry.account.transport_failures = 0;
        }
    }

    /// 账号当前状态的副本
    pub async fn get(&self, account_id: &str) -> Option<Account> {
        self.state
            .read()
            .await
            .accounts
            .get(account_id)
            .map(|entry| entry.account.clone())
    }

    /// 所有账号的管理端视图，按ID排序
    pub async fn snapshots(&self, now: DateTime<Utc>) -> Vec<AccountSnapshot> {
        let state = self.state.read().await;
        let mut snapshots: Vec<_> = state
            .accounts
            .values()
            .map(|entry| entry.account.snapshot(now))
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// 账号池统计
    pub async fn stats(&self, now: DateTime<Utc>) -> PoolStats {
        let state = self.state.read().await;
        let accounts = state.accounts.values().map(|entry| &entry.account);
        PoolStats {
            total: state.accounts.len(),
            schedulable: accounts.clone().filter(|a| a.schedulable).count(),
            rate_limited: accounts.clone().filter(|a| a.is_rate_limited_at(now)).count(),
            errored: accounts.filter(|a| a.last_error.is_some()).count(),
            proxies: state.proxies.len(),
        }
    }
}

/// 新记录覆盖持久化字段，保留运行时字段
///
/// 池中的 OAuth 令牌比记录中的更晚过期时保留池中的令牌（刷新先写池、后写存储）。
fn merge_runtime(old: &PoolEntry, mut account: Account) -> PoolEntry {
    if let (Some(current), Some(incoming)) = (old.account.credential.oauth(), account.credential.oauth())
        && current.expires_at > incoming.expires_at
    {
        account.credential = old.account.credential.clone();
    }
    account.last_used_at = old.account.last_used_at;
    account.transport_failures = old.account.transport_failures;
    account.rate_limited_until = match (old.account.rate_limited_until, account.rate_limited_until) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    PoolEntry {
        account,
        use_seq: old.use_seq,
    }
}
