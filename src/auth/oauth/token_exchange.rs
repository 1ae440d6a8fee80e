//! # Token交换逻辑
//!
//! Claude OAuth 的授权码交换、setup token、sessionKey 授权与刷新令牌。
//! 令牌端点只接受 JSON 请求体，并需要 CLI 的 User-Agent。

use super::nested_id::{NestedId, extract_id};
use super::pkce::{CHALLENGE_METHOD, PkceParams};
use crate::config::OAuthConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::provider::CLI_USER_AGENT;
use crate::types::OAuthTokens;
use crate::{ldebug, lwarn};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// setup token 申请的有效期（秒）
pub const SETUP_TOKEN_EXPIRES_IN: i64 = 365 * 24 * 60 * 60;

/// 授权流程类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizeFlow {
    /// 完整授权，获得可刷新的令牌
    Full,
    /// 仅推理权限的长期令牌，无刷新令牌
    SetupToken,
}

/// 令牌端点的原始响应
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// 访问令牌
    pub access_token: String,
    /// 刷新令牌
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// 有效期（秒）
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// 授权范围
    #[serde(default)]
    pub scope: Option<String>,
    /// 所属组织
    #[serde(default)]
    pub organization: Option<NestedId>,
    /// 所属账号
    #[serde(default)]
    pub account: Option<NestedId>,
}

impl TokenResponse {
    /// 转换为保存的令牌
    #[must_use]
    pub fn into_tokens(self, now: DateTime<Utc>) -> OAuthTokens {
        let expires_in = self.expires_in.unwrap_or(3600).max(0);
        OAuthTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|token| !token.is_empty()),
            expires_at: Duration::try_seconds(expires_in)
                .and_then(|ttl| now.checked_add_signed(ttl))
                .unwrap_or(now),
            scope: self.scope,
        }
    }

    /// 组织ID
    #[must_use]
    pub fn organization_id(&self) -> Option<&str> {
        extract_id(self.organization.as_ref())
    }
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// 刷新失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshFailure {
    /// 失败原因
    pub message: String,
    /// 是否可能是暂时性故障（网络、5xx、429）
    pub transient: bool,
}

impl std::fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// 授权页地址与对应的 PKCE 参数
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    /// 授权页地址
    pub url: String,
    /// state
    pub state: String,
    /// PKCE
    pub pkce: PkceParams,
    /// 流程类型
    pub flow: AuthorizeFlow,
}

#[derive(Debug, Deserialize)]
struct OrganizationEntry {
    #[serde(default)]
    uuid: Option<NestedId>,
    #[serde(default)]
    organization: Option<NestedId>,
    #[serde(default)]
    capabilities: Vec<String>,
}

impl OrganizationEntry {
    fn id(&self) -> Option<&str> {
        extract_id(self.uuid.as_ref()).or_else(|| extract_id(self.organization.as_ref()))
    }
}

#[derive(Debug, Deserialize)]
struct CookieAuthorizeResponse {
    redirect_uri: String,
}

/// Claude OAuth 客户端
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    config: OAuthConfig,
}

impl OAuthClient {
    /// 创建客户端
    #[must_use]
    pub const fn new(http: reqwest::Client, config: OAuthConfig) -> Self {
        Self { http, config }
    }

    /// 当前配置
    #[must_use]
    pub const fn config(&self) -> &OAuthConfig {
        &self.config
    }

    fn scope_for(&self, flow: AuthorizeFlow) -> &str {
        match flow {
            AuthorizeFlow::Full => &self.config.scopes,
            AuthorizeFlow::SetupToken => &self.config.setup_token_scope,
        }
    }

    /// 生成管理员打开的授权页地址
    pub fn build_authorize_url(&self, flow: AuthorizeFlow) -> Result<AuthorizeRequest> {
        let pkce = PkceParams::new();
        let state = super::pkce::random_string(32);
        let mut url = Url::parse(&self.config.authorize_url).map_err(|e| {
            ProxyError::config_with_source(
                format!("无效的授权地址: {}", self.config.authorize_url),
                e,
            )
        })?;
        url.query_pairs_mut()
            .append_pair("code", "true")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", self.scope_for(flow))
            .append_pair("code_challenge", pkce.challenge())
            .append_pair("code_challenge_method", CHALLENGE_METHOD)
            .append_pair("state", &state);

        Ok(AuthorizeRequest {
            url: url.into(),
            state,
            pkce,
            flow,
        })
    }

    /// 用授权码交换令牌
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        state: &str,
        flow: AuthorizeFlow,
    ) -> Result<OAuthTokens> {
        let mut body = serde_json::json!({
            "grant_type": "authorization_code",
            "client_id": self.config.client_id,
            "code": strip_fragment(code),
            "redirect_uri": self.config.redirect_uri,
            "code_verifier": code_verifier,
            "state": state,
        });
        if flow == AuthorizeFlow::SetupToken {
            body["expires_in"] = serde_json::json!(SETUP_TOKEN_EXPIRES_IN);
        }

        let response = self
            .post_token(&body)
            .await
            .map_err(|failure| ProxyError::auth(format!("授权码交换失败: {failure}")))?;
        let mut tokens = response.into_tokens(Utc::now());
        if flow == AuthorizeFlow::SetupToken {
            tokens.refresh_token = None;
        }
        Ok(tokens)
    }

    /// 使用 claude.ai 的 sessionKey 完成授权并交换令牌
    pub async fn exchange_session_cookie(
        &self,
        session_key: &str,
        flow: AuthorizeFlow,
    ) -> Result<OAuthTokens> {
        let cookie = format!("sessionKey={}", session_key.trim());
        let base = self.config.claude_ai_base_url.trim_end_matches('/');

        let organizations: Vec<OrganizationEntry> = self
            .http
            .get(format!("{base}/api/organizations"))
            .header(reqwest::header::COOKIE, &cookie)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ProxyError::auth(format!("sessionKey 无效: {e}")))?
            .json()
            .await?;

        let organization_id = organizations
            .iter()
            .filter(|entry| entry.capabilities.iter().any(|c| c == "chat"))
            .chain(organizations.iter())
            .find_map(OrganizationEntry::id)
            .ok_or_else(|| ProxyError::auth("sessionKey 对应的账号没有可用组织"))?
            .to_string();

        let authorize = self.build_authorize_url(flow)?;
        let response: CookieAuthorizeResponse = self
            .http
            .post(format!("{base}/v1/oauth/{organization_id}/authorize"))
            .header(reqwest::header::COOKIE, &cookie)
            .json(&serde_json::json!({
                "response_type": "code",
                "client_id": self.config.client_id,
                "organization_uuid": organization_id,
                "redirect_uri": self.config.redirect_uri,
                "scope": self.scope_for(flow),
                "state": authorize.state,
                "code_challenge": authorize.pkce.challenge(),
                "code_challenge_method": CHALLENGE_METHOD,
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ProxyError::auth(format!("sessionKey 授权失败: {e}")))?
            .json()
            .await?;

        let code = code_from_redirect(&response.redirect_uri)
            .ok_or_else(|| ProxyError::auth("授权响应中没有授权码"))?;

        ldebug!(
            "system",
            LogStage::CredentialRefresh,
            LogComponent::OAuth,
            "cookie_authorized",
            "sessionKey 授权成功，开始交换令牌",
            organization_id = %organization_id
        );

        self.exchange_code(&code, authorize.pkce.verifier(), &authorize.state, flow)
            .await
    }

    /// 使用刷新令牌换取新令牌；新响应未带刷新令牌时沿用旧的
    pub async fn refresh(
        &self,
        refresh_token: &str,
    ) -> std::result::Result<OAuthTokens, RefreshFailure> {
        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": self.config.client_id,
        });
        let response = self.post_token(&body).await?;
        let mut tokens = response.into_tokens(Utc::now());
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_string());
        }
        Ok(tokens)
    }

    async fn post_token(
        &self,
        body: &serde_json::Value,
    ) -> std::result::Result<TokenResponse, RefreshFailure> {
        let response = self
            .http
            .post(&self.config.token_url)
            .header(reqwest::header::ACCEPT, "application/json, text/plain, */*")
            .header(reqwest::header::USER_AGENT, CLI_USER_AGENT)
            .json(body)
            .send()
            .await
            .map_err(|e| RefreshFailure {
                message: format!("token endpoint unreachable: {e}"),
                transient: true,
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| RefreshFailure {
            message: format!("failed to read token response: {e}"),
            transient: true,
        })?;

        if !status.is_success() {
            let transient = status.is_server_error() || status.as_u16() == 429;
            let message = serde_json::from_str::<TokenErrorResponse>(&text).map_or_else(
                |_| format!("HTTP {status}"),
                |error| {
                    format!(
                        "HTTP {status}: {} {}",
                        error.error,
                        error.error_description.unwrap_or_default()
                    )
                    .trim_end()
                    .to_string()
                },
            );
            lwarn!(
                "system",
                LogStage::CredentialRefresh,
                LogComponent::OAuth,
                "token_request_failed",
                "令牌端点返回错误",
                status = status.as_u16(),
                transient = transient
            );
            return Err(RefreshFailure { message, transient });
        }

        serde_json::from_str(&text).map_err(|e| RefreshFailure {
            message: format!("invalid token response: {e}"),
            transient: false,
        })
    }
}

/// 去掉授权码中的 `#fragment`
#[must_use]
pub fn strip_fragment(code: &str) -> &str {
    code.split_once('#').map_or(code, |(code, _)| code).trim()
}

/// 从回调地址中提取 `code` 参数
#[must_use]
pub fn code_from_redirect(redirect_uri: &str) -> Option<String> {
    Url::parse(redirect_uri)
        .ok()?
        .query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .filter(|code| !code.is_empty())
}
