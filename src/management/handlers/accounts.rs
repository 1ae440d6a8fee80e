//! # 账号管理处理器
//!
//! 每个操作先写存储，再从存储重新读取该账号同步到账号池。

use crate::error::{ProxyError, Result};
use crate::key_pool::PoolStats;
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::management::response;
use crate::proxy::AppState;
use crate::store::RuntimeUpdate;
use crate::types::AccountSnapshot;
use axum::Json;
use axum::extract::{Path, State};
use axum::response::Response;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// 账号列表
#[derive(Debug, Serialize)]
pub struct AccountList {
    pub stats: PoolStats,
    pub accounts: Vec<AccountSnapshot>,
}

/// 切换调度请求
#[derive(Debug, Deserialize)]
pub struct SchedulableRequest {
    pub schedulable: bool,
}

/// 从存储重新读取账号并同步到账号池，返回最新视图
pub(crate) async fn resync_account(state: &AppState, account_id: &str) -> Result<AccountSnapshot> {
    let record = state
        .store
        .load_account(account_id)
        .await?
        .filter(|record| !record.deleted)
        .ok_or_else(|| ProxyError::not_found("account", account_id))?;
    state.pool.upsert(record).await?;
    snapshot(state, account_id).await
}

async fn snapshot(state: &AppState, account_id: &str) -> Result<AccountSnapshot> {
    state
        .pool
        .get(account_id)
        .await
        .map(|account| account.snapshot(Utc::now()))
        .ok_or_else(|| ProxyError::not_found("account", account_id))
}

/// 账号列表与统计
pub async fn list_accounts(State(state): State<AppState>) -> Response {
    let now = Utc::now();
    response::success(AccountList {
        stats: state.pool.stats(now).await,
        accounts: state.pool.snapshots(now).await,
    })
}

/// 切换是否参与调度
pub async fn set_schedulable(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(request): Json<SchedulableRequest>,
) -> Response {
    let result = async {
        state
            .store
            .save_runtime(&account_id, RuntimeUpdate::Schedulable(request.schedulable))
            .await?;
        let snapshot = resync_account(&state, &account_id).await?;
        linfo!(
            "system",
            LogStage::Management,
            LogComponent::Management,
            "schedulable_changed",
            "账号调度开关已更新",
            account_id = %account_id,
            schedulable = request.schedulable
        );
        Ok::<_, ProxyError>(snapshot)
    }
    .await;
    response::from_result(result, "调度状态已更新")
}

/// 清除错误记录
pub async fn clear_error(State(state): State<AppState>, Path(account_id): Path<String>) -> Response {
    let result = async {
        state
            .store
            .save_runtime(&account_id, RuntimeUpdate::ClearError)
            .await?;
        state.pool.clear_error(&account_id).await?;
        resync_account(&state, &account_id).await
    }
    .await;
    response::from_result(result, "错误记录已清除")
}

/// 强制解除限流冷却
pub async fn clear_rate_limit(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Response {
    let result = async {
        state
            .store
            .save_runtime(&account_id, RuntimeUpdate::ClearRateLimit)
            .await?;
        state.tracker.clear(&account_id).await?;
        resync_account(&state, &account_id).await
    }
    .await;
    response::from_result(result, "限流状态已清除")
}

/// 立即刷新 OAuth 凭证，也用于测试账号是否可用
pub async fn refresh_credential(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Response {
    let result = async {
        state.credentials.force_refresh(&account_id).await?;
        snapshot(&state, &account_id).await
    }
    .await;
    response::from_result(result, "凭证已刷新")
}

/// 软删除账号，立即从账号池移除
pub async fn delete_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Response {
    let result = async {
        state.store.soft_delete_account(&account_id).await?;
        state.pool.remove(&account_id).await;
        Ok::<_, ProxyError>(())
    }
    .await;
    match result {
        Ok(()) => response::success_without_data("账号已删除"),
        Err(e) => response::app_error(e),
    }
}
