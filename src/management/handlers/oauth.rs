//! # OAuth 账号接入
//!
//! 生成授权页地址，完成授权码或 sessionKey 交换；请求中带有 `account` 时直接创建账号。

use super::accounts::resync_account;
use crate::auth::{AuthorizeFlow, ExchangeInput};
use crate::error::Result;
use crate::{ensure_business, linfo};
use crate::logging::{LogComponent, LogStage};
use crate::management::response;
use crate::proxy::AppState;
use crate::types::{
    AccountRecord, AccountSnapshot, Credential, GroupId, Platform, ProxyId, RecordKind,
};
use axum::Json;
use axum::extract::State;
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 授权页请求
#[derive(Debug, Deserialize)]
pub struct AuthorizeUrlRequest {
    #[serde(default = "default_flow")]
    pub flow: AuthorizeFlow,
}

const fn default_flow() -> AuthorizeFlow {
    AuthorizeFlow::Full
}

/// 交换成功后创建的账号
#[derive(Debug, Deserialize)]
pub struct NewAccount {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_platform")]
    pub platform: Platform,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub proxy_id: Option<ProxyId>,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub supported_models: Vec<String>,
}

const fn default_platform() -> Platform {
    Platform::Anthropic
}

impl NewAccount {
    fn into_record(self, credential: Credential) -> AccountRecord {
        AccountRecord {
            id: self.id,
            name: self.name,
            platform: self.platform,
            kind: RecordKind::OAuthSession,
            base_url: self.base_url,
            credential,
            proxy_id: self.proxy_id,
            group_ids: self.group_ids,
            supported_models: self.supported_models,
            schedulable: true,
            rate_limited_until: None,
            last_error: None,
            deleted: false,
        }
    }
}

/// 交换请求
#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    #[serde(flatten)]
    pub input: ExchangeInput,
    #[serde(default)]
    pub account: Option<NewAccount>,
}

/// 交换结果；创建了账号时不回传凭证
#[derive(Debug, Serialize)]
pub struct ExchangeResult {
    pub expires_at: Option<DateTime<Utc>>,
    pub refreshable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountSnapshot>,
}

/// 生成授权页地址
pub async fn authorize_url(
    State(state): State<AppState>,
    Json(request): Json<AuthorizeUrlRequest>,
) -> Response {
    response::from_result(
        state.credentials.begin_authorization(request.flow),
        "授权链接已生成",
    )
}

/// 完成交换
pub async fn exchange(State(state): State<AppState>, Json(request): Json<ExchangeRequest>) -> Response {
    response::from_result(run_exchange(&state, request).await, "授权交换成功")
}

async fn run_exchange(state: &AppState, request: ExchangeRequest) -> Result<ExchangeResult> {
    if let Some(account) = &request.account {
        ensure_business!(!account.id.trim().is_empty(), "account id must not be empty");
        ensure_business!(
            state.pool.get(&account.id).await.is_none(),
            "account {} already exists",
            account.id
        );
    }

    let credential = state.credentials.exchange(request.input).await?;
    let tokens = credential.oauth();
    let expires_at = tokens.map(|tokens| tokens.expires_at);
    let refreshable = tokens.is_some_and(|tokens| tokens.refresh_token.is_some());

    let Some(account) = request.account else {
        return Ok(ExchangeResult {
            expires_at,
            refreshable,
            credential: Some(credential),
            account: None,
        });
    };

    let record = state.store.insert_account(account.into_record(credential)).await?;
    let snapshot = resync_account(state, &record.id).await?;
    linfo!(
        "system",
        LogStage::Management,
        LogComponent::Management,
        "account_created",
        "OAuth 账号已创建",
        account_id = %record.id,
        platform = %record.platform
    );
    Ok(ExchangeResult {
        expires_at,
        refreshable,
        credential: None,
        account: Some(snapshot),
    })
}
