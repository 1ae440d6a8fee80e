//! # 错误透传规则管理
//!
//! 写入存储后整体重新读取规则集并替换到引擎，下一次评估即生效。

use crate::error::{ProxyError, Result};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::management::response;
use crate::passthrough::ErrorPassthroughRule;
use crate::proxy::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::response::Response;

async fn reload_rules(state: &AppState) -> Result<usize> {
    let rules = state.store.load_rules().await?;
    let count = rules.len();
    state.passthrough.replace_rules(rules).await;
    Ok(count)
}

async fn save_rule(state: &AppState, rule: ErrorPassthroughRule) -> Result<ErrorPassthroughRule> {
    rule.validate().map_err(ProxyError::business)?;
    let saved = state.store.upsert_rule(rule).await?;
    let total = reload_rules(state).await?;
    linfo!(
        "system",
        LogStage::Management,
        LogComponent::Passthrough,
        "rule_saved",
        "错误透传规则已保存",
        rule_id = saved.id,
        priority = saved.priority,
        total = total
    );
    Ok(saved)
}

/// 规则列表，按评估顺序排列
pub async fn list_rules(State(state): State<AppState>) -> Response {
    let rules = state.passthrough.rules().await;
    response::success(rules.as_slice())
}

/// 新增规则，ID 由存储分配
pub async fn create_rule(
    State(state): State<AppState>,
    Json(mut rule): Json<ErrorPassthroughRule>,
) -> Response {
    rule.id = 0;
    response::from_result(save_rule(&state, rule).await, "规则已创建")
}

/// 更新规则
pub async fn update_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<i64>,
    Json(mut rule): Json<ErrorPassthroughRule>,
) -> Response {
    let result = async {
        let exists = state
            .store
            .load_rules()
            .await?
            .iter()
            .any(|existing| existing.id == rule_id);
        if !exists {
            return Err(ProxyError::not_found("error passthrough rule", rule_id.to_string()));
        }
        rule.id = rule_id;
        save_rule(&state, rule).await
    }
    .await;
    response::from_result(result, "规则已更新")
}

/// 删除规则
pub async fn delete_rule(State(state): State<AppState>, Path(rule_id): Path<i64>) -> Response {
    let result = async {
        if !state.store.delete_rule(rule_id).await? {
            return Err(ProxyError::not_found("error passthrough rule", rule_id.to_string()));
        }
        reload_rules(&state).await
    }
    .await;
    match result {
        Ok(_) => response::success_without_data("规则已删除"),
        Err(e) => response::app_error(e),
    }
}
