//! # 凭证管理
//!
//! OAuth 账号在转发前确保访问令牌新鲜；同一账号的并发刷新合并为一次网络调用，
//! 所有等待者共享同一个结果。另负责管理员添加账号时的一次性授权交换。

use super::oauth::{AuthorizeFlow, OAuthClient, RefreshFailure};
use crate::error::{ProxyError, Result};
use crate::key_pool::AccountPool;
use crate::logging::{LogComponent, LogStage};
use crate::store::{AccountStore, RuntimeUpdate};
use crate::types::{Account, AccountError, AccountId, Credential, OAuthTokens};
use crate::{ldebug, lerror, linfo, lwarn};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 授权会话有效期
const AUTHORIZATION_TTL_SECS: i64 = 10 * 60;

type RefreshOutcome = std::result::Result<OAuthTokens, RefreshFailure>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct InFlight {
    generation: u64,
    future: SharedRefresh,
}

struct PendingAuthorization {
    verifier: String,
    flow: AuthorizeFlow,
    created_at: DateTime<Utc>,
}

/// 管理员打开授权页所需的信息
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationSession {
    /// 授权页地址
    pub authorize_url: String,
    /// 会话ID，同时也是 OAuth state
    pub session_id: String,
    /// 流程类型
    pub flow: AuthorizeFlow,
    /// 会话过期时间
    pub expires_at: DateTime<Utc>,
}

/// 一次性交换的输入
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ExchangeInput {
    /// 授权页回调得到的授权码
    AuthorizationCode {
        /// `begin_authorization` 返回的会话ID
        session_id: String,
        /// 授权码，可带 `#state`
        code: String,
    },
    /// claude.ai 的 sessionKey
    SessionCookie {
        /// Cookie 值
        session_key: String,
        /// 流程类型
        #[serde(default = "default_flow")]
        flow: AuthorizeFlow,
    },
}

const fn default_flow() -> AuthorizeFlow {
    AuthorizeFlow::Full
}

/// 凭证管理器
pub struct CredentialManager {
    client: OAuthClient,
    pool: Arc<AccountPool>,
    store: Arc<dyn AccountStore>,
    refresh_skew: Duration,
    inflight: Arc<DashMap<AccountId, InFlight>>,
    generation: AtomicU64,
    pending: DashMap<String, PendingAuthorization>,
}

impl CredentialManager {
    /// 创建凭证管理器
    #[must_use]
    pub fn new(client: OAuthClient, pool: Arc<AccountPool>, store: Arc<dyn AccountStore>) -> Self {
        let refresh_skew = Duration::try_seconds(client.config().refresh_skew_secs.max(0))
            .unwrap_or_else(Duration::zero);
        Self {
            client,
            pool,
            store,
            refresh_skew,
            inflight: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            pending: DashMap::new(),
        }
    }

    /// OAuth 客户端
    #[must_use]
    pub const fn client(&self) -> &OAuthClient {
        &self.client
    }

    /// 令牌是否需要刷新
    #[must_use]
    pub fn needs_refresh(&self, tokens: &OAuthTokens, now: DateTime<Utc>) -> bool {
        needs_refresh(tokens, self.refresh_skew, now)
    }

    /// 确保账号凭证可用，返回本次请求应使用的凭证
    pub async fn ensure_fresh(
        &self,
        request_id: &str,
        account: &Account,
        now: DateTime<Utc>,
    ) -> Result<Credential> {
        if account.credential.oauth().is_none() {
            return Ok(account.credential.clone());
        }

        let credential = self
            .pool
            .get(&account.id)
            .await
            .map_or_else(|| account.credential.clone(), |current| current.credential);
        let Some(tokens) = credential.oauth() else {
            return Ok(credential);
        };

        if !self.needs_refresh(tokens, now) {
            return Ok(credential);
        }

        if tokens.refresh_token.is_none() {
            if now < tokens.expires_at {
                return Ok(credential);
            }
            let message = "setup token expired and cannot be refreshed";
            self.record_failure(&account.id, message).await;
            return Err(ProxyError::credential_refresh_failed(&account.id, message));
        }

        ldebug!(
            request_id,
            LogStage::CredentialRefresh,
            LogComponent::OAuth,
            "refresh_needed",
            "访问令牌即将过期，等待刷新",
            account_id = %account.id,
            expires_at = %tokens.expires_at
        );

        self.join_refresh(&account.id, false)
            .await
            .map(Credential::OAuth)
            .map_err(|failure| ProxyError::credential_refresh_failed(&account.id, failure.message))
    }

    /// 管理员触发的立即刷新，忽略令牌是否新鲜
    pub async fn force_refresh(&self, account_id: &str) -> Result<Credential> {
        let account = self
            .pool
            .get(account_id)
            .await
            .ok_or_else(|| ProxyError::not_found("account", account_id))?;
        let Some(tokens) = account.credential.oauth() else {
            return Err(ProxyError::business(format!(
                "account {account_id} uses an API key and has nothing to refresh"
            )));
        };
        if tokens.refresh_token.is_none() {
            return Err(ProxyError::business(format!(
                "account {account_id} holds a setup token without refresh token"
            )));
        }

        self.join_refresh(account_id, true)
            .await
            .map(Credential::OAuth)
            .map_err(|failure| ProxyError::credential_refresh_failed(account_id, failure.message))
    }

    /// 当前正在进行的刷新数量
    #[must_use]
    pub fn inflight_refreshes(&self) -> usize {
        self.inflight.len()
    }

    fn join_refresh(&self, account_id: &str, force: bool) -> SharedRefresh {
        let entry = self
            .inflight
            .entry(account_id.to_string())
            .or_insert_with(|| {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let task = RefreshTask {
                    client: self.client.clone(),
                    pool: Arc::clone(&self.pool),
                    store: Arc::clone(&self.store),
                    inflight: Arc::clone(&self.inflight),
                    account_id: account_id.to_string(),
                    refresh_skew: self.refresh_skew,
                    generation,
                    force,
                };
                let handle = tokio::spawn(task.run());
                let future = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(RefreshFailure {
                            message: format!("refresh task aborted: {e}"),
                            transient: true,
                        })
                    })
                }
                .boxed()
                .shared();
                InFlight { generation, future }
            });
        entry.future.clone()
    }

    async fn record_failure(&self, account_id: &str, message: &str) {
        record_failure(&self.pool, self.store.as_ref(), account_id, message).await;
    }

    /// 开始一次授权，返回授权页地址
    pub fn begin_authorization(&self, flow: AuthorizeFlow) -> Result<AuthorizationSession> {
        let now = Utc::now();
        self.purge_expired_sessions(now);

        let request = self.client.build_authorize_url(flow)?;
        self.pending.insert(
            request.state.clone(),
            PendingAuthorization {
                verifier: request.pkce.verifier().to_string(),
                flow,
                created_at: now,
            },
        );

        Ok(AuthorizationSession {
            authorize_url: request.url,
            session_id: request.state,
            flow,
            expires_at: now + Duration::seconds(AUTHORIZATION_TTL_SECS),
        })
    }

    fn purge_expired_sessions(&self, now: DateTime<Utc>) {
        self.pending.retain(|_, pending| {
            now - pending.created_at < Duration::seconds(AUTHORIZATION_TTL_SECS)
        });
    }

    /// 完成一次性交换，得到新凭证
    pub async fn exchange(&self, input: ExchangeInput) -> Result<Credential> {
        let tokens = match input {
            ExchangeInput::AuthorizationCode { session_id, code } => {
                self.purge_expired_sessions(Utc::now());
                let (state, pending) = self
                    .pending
                    .remove(&session_id)
                    .ok_or_else(|| ProxyError::not_found("authorization session", &session_id))?;
                self.client
                    .exchange_code(&code, &pending.verifier, &state, pending.flow)
                    .await?
            }
            ExchangeInput::SessionCookie { session_key, flow } => {
                if session_key.trim().is_empty() {
                    return Err(ProxyError::business("session_key must not be empty"));
                }
                self.client.exchange_session_cookie(&session_key, flow).await?
            }
        };

        linfo!(
            "system",
            LogStage::Management,
            LogComponent::OAuth,
            "credential_exchanged",
            "OAuth 授权交换成功",
            expires_at = %tokens.expires_at,
            refreshable = tokens.refresh_token.is_some()
        );
        Ok(Credential::OAuth(tokens))
    }
}

fn needs_refresh(tokens: &OAuthTokens, skew: Duration, now: DateTime<Utc>) -> bool {
    let threshold = tokens
        .expires_at
        .checked_sub_signed(skew)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    now >= threshold
}

async fn record_failure(
    pool: &AccountPool,
    store: &dyn AccountStore,
    account_id: &str,
    message: &str,
) {
    let at = Utc::now();
    if let Err(e) = pool.set_last_error(account_id, message, at).await {
        lwarn!(
            "system",
            LogStage::CredentialRefresh,
            LogComponent::KeyPool,
            "record_error_failed",
            "无法记录账号错误",
            account_id = %account_id,
            error = %e
        );
    }
    let update = RuntimeUpdate::Error(AccountError {
        message: message.to_string(),
        at,
    });
    if let Err(e) = store.save_runtime(account_id, update).await {
        lwarn!(
            "system",
            LogStage::CredentialRefresh,
            LogComponent::Store,
            "persist_error_failed",
            "无法持久化账号错误",
            account_id = %account_id,
            error = %e
        );
    }
}

/// 一次刷新的执行体，运行在独立任务中，调用方取消不会中断它
struct RefreshTask {
    client: OAuthClient,
    pool: Arc<AccountPool>,
    store: Arc<dyn AccountStore>,
    inflight: Arc<DashMap<AccountId, InFlight>>,
    account_id: AccountId,
    refresh_skew: Duration,
    generation: u64,
    force: bool,
}

impl RefreshTask {
    async fn run(self) -> RefreshOutcome {
        let outcome = self.refresh().await;
        let generation = self.generation;
        self.inflight
            .remove_if(&self.account_id, |_, entry| entry.generation == generation);
        outcome
    }

    async fn refresh(&self) -> RefreshOutcome {
        let account = self.pool.get(&self.account_id).await.ok_or_else(|| RefreshFailure {
            message: format!("account {} no longer exists", self.account_id),
            transient: false,
        })?;
        let tokens = account.credential.oauth().ok_or_else(|| RefreshFailure {
            message: "account does not hold OAuth tokens".to_string(),
            transient: false,
        })?;

        if !self.force && !needs_refresh(tokens, self.refresh_skew, Utc::now()) {
            return Ok(tokens.clone());
        }
        let refresh_token = tokens.refresh_token.clone().ok_or_else(|| RefreshFailure {
            message: "no refresh token".to_string(),
            transient: false,
        })?;

        let result = match self.client.refresh(&refresh_token).await {
            Err(failure) if failure.transient => {
                lwarn!(
                    "system",
                    LogStage::CredentialRefresh,
                    LogComponent::OAuth,
                    "refresh_retry",
                    "刷新遇到暂时性故障，立即重试一次",
                    account_id = %self.account_id,
                    error = %failure
                );
                self.client.refresh(&refresh_token).await
            }
            other => other,
        };

        match result {
            Ok(tokens) => {
                let credential = Credential::OAuth(tokens.clone());
                self.pool
                    .update_credential(&self.account_id, credential.clone())
                    .await
                    .map_err(|e| RefreshFailure {
                        message: e.to_string(),
                        transient: false,
                    })?;
                if let Err(e) = self
                    .store
                    .save_runtime(&self.account_id, RuntimeUpdate::Credential(credential))
                    .await
                {
                    lwarn!(
                        "system",
                        LogStage::CredentialRefresh,
                        LogComponent::Store,
                        "persist_credential_failed",
                        "新令牌未能持久化",
                        account_id = %self.account_id,
                        error = %e
                    );
                }
                linfo!(
                    "system",
                    LogStage::CredentialRefresh,
                    LogComponent::OAuth,
                    "refresh_succeeded",
                    "访问令牌已刷新",
                    account_id = %self.account_id,
                    expires_at = %tokens.expires_at
                );
                Ok(tokens)
            }
            Err(failure) => {
                lerror!(
                    "system",
                    LogStage::CredentialRefresh,
                    LogComponent::OAuth,
                    "refresh_failed",
                    "访问令牌刷新失败",
                    account_id = %self.account_id,
                    error = %failure
                );
                record_failure(
                    &self.pool,
                    self.store.as_ref(),
                    &self.account_id,
                    &format!("token refresh failed: {}", failure.message),
                )
                .await;
                Err(failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthConfig;
    use crate::store::MemoryStore;
    use crate::types::{AccountRecord, Platform, RecordKind};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn oauth_record(id: &str, expires_at: DateTime<Utc>, refresh: Option<&str>) -> AccountRecord {
        AccountRecord {
            id: id.to_string(),
            name: String::new(),
            platform: Platform::Anthropic,
            kind: RecordKind::OAuthSession,
            base_url: None,
            credential: Credential::OAuth(OAuthTokens {
                access_token: "old-at".to_string(),
                refresh_token: refresh.map(str::to_string),
                expires_at,
                scope: None,
            }),
            proxy_id: None,
            group_ids: vec![],
            supported_models: vec![],
            schedulable: true,
            rate_limited_until: None,
            last_error: None,
            deleted: false,
        }
    }

    async fn manager(
        server: &MockServer,
        records: Vec<AccountRecord>,
    ) -> (CredentialManager, Arc<AccountPool>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::from_seed(crate::config::SeedConfig {
            accounts: records.clone(),
            ..Default::default()
        }));
        let pool = Arc::new(AccountPool::new());
        pool.load(records, vec![]).await.unwrap();
        let client = OAuthClient::new(
            reqwest::Client::new(),
            OAuthConfig {
                token_url: format!("{}/v1/oauth/token", server.uri()),
                ..OAuthConfig::default()
            },
        );
        let manager = CredentialManager::new(client, Arc::clone(&pool), store.clone());
        (manager, pool, store)
    }

    fn token_ok() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "new-at",
            "refresh_token": "new-rt",
            "expires_in": 28800,
        }))
    }

    #[tokio::test]
    async fn test_api_key_is_noop() {
        let server = MockServer::start().await;
        let mut record = oauth_record("a", Utc::now(), None);
        record.kind = RecordKind::ApiKey;
        record.credential = Credential::ApiKey {
            api_key: "sk".to_string(),
        };
        let (manager, pool, _) = manager(&server, vec![record]).await;
        let account = pool.get("a").await.unwrap();

        let credential = manager.ensure_fresh("req", &account, Utc::now()).await.unwrap();
        assert_eq!(credential.secret(), "sk");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_token_is_noop() {
        let server = MockServer::start().await;
        let record = oauth_record("a", Utc::now() + Duration::hours(2), Some("rt"));
        let (manager, pool, _) = manager(&server, vec![record]).await;
        let account = pool.get("a").await.unwrap();

        let credential = manager.ensure_fresh("req", &account, Utc::now()).await.unwrap();
        assert_eq!(credential.secret(), "old-at");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_token_within_skew_is_refreshed_and_persisted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(token_ok())
            .expect(1)
            .mount(&server)
            .await;
        let record = oauth_record("a", Utc::now() + Duration::seconds(30), Some("rt"));
        let (manager, pool, store) = manager(&server, vec![record]).await;
        let account = pool.get("a").await.unwrap();

        let credential = manager.ensure_fresh("req", &account, Utc::now()).await.unwrap();
        assert_eq!(credential.secret(), "new-at");
        assert_eq!(pool.get("a").await.unwrap().credential.secret(), "new-at");
        let stored = store.load_account("a").await.unwrap().unwrap();
        assert_eq!(stored.credential.secret(), "new-at");
        assert_eq!(manager.inflight_refreshes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(token_ok().set_delay(std::time::Duration::from_millis(200)))
            .mount(&server)
            .await;
        let record = oauth_record("a", Utc::now() - Duration::minutes(1), Some("rt"));
        let (manager, pool, _) = manager(&server, vec![record]).await;
        let manager = Arc::new(manager);
        let account = pool.get("a").await.unwrap();

        let calls = (0..50).map(|i| {
            let manager = Arc::clone(&manager);
            let account = account.clone();
            tokio::spawn(async move {
                manager
                    .ensure_fresh(&format!("req-{i}"), &account, Utc::now())
                    .await
            })
        });
        for result in futures::future::join_all(calls).await {
            assert_eq!(result.unwrap().unwrap().secret(), "new-at");
        }

        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_marks_account() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "invalid_grant"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        let record = oauth_record("a", Utc::now() - Duration::minutes(1), Some("rt"));
        let (manager, pool, _) = manager(&server, vec![record]).await;
        let account = pool.get("a").await.unwrap();

        let error = manager.ensure_fresh("req", &account, Utc::now()).await.unwrap_err();
        assert!(matches!(error, ProxyError::CredentialRefreshFailed { .. }));
        assert!(error.is_retryable());
        let last_error = pool.get("a").await.unwrap().last_error.unwrap();
        assert!(last_error.message.contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;
        let record = oauth_record("a", Utc::now() - Duration::minutes(1), Some("rt"));
        let (manager, pool, _) = manager(&server, vec![record]).await;
        let account = pool.get("a").await.unwrap();

        assert!(manager.ensure_fresh("req", &account, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_setup_token_without_refresh_token() {
        let server = MockServer::start().await;
        let now = Utc::now();
        let valid = oauth_record("valid", now + Duration::seconds(60), None);
        let expired = oauth_record("expired", now - Duration::seconds(1), None);
        let (manager, pool, _) = manager(&server, vec![valid, expired]).await;

        let account = pool.get("valid").await.unwrap();
        assert!(manager.ensure_fresh("req", &account, now).await.is_ok());

        let account = pool.get("expired").await.unwrap();
        let error = manager.ensure_fresh("req", &account, now).await.unwrap_err();
        assert!(matches!(error, ProxyError::CredentialRefreshFailed { .. }));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_force_refresh_ignores_freshness() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(token_ok())
            .expect(1)
            .mount(&server)
            .await;
        let record = oauth_record("a", Utc::now() + Duration::hours(5), Some("rt"));
        let (manager, _, _) = manager(&server, vec![record]).await;

        let credential = manager.force_refresh("a").await.unwrap();
        assert_eq!(credential.secret(), "new-at");
        assert!(manager.force_refresh("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_exchange_requires_known_session() {
        let server = MockServer::start().await;
        let (manager, _, _) = manager(&server, vec![]).await;

        let session = manager.begin_authorization(AuthorizeFlow::Full).unwrap();
        assert!(session.authorize_url.contains(&session.session_id));

        let error = manager
            .exchange(ExchangeInput::AuthorizationCode {
                session_id: "unknown".to_string(),
                code: "c".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(error, ProxyError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_exchange_consumes_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(token_ok())
            .expect(1)
            .mount(&server)
            .await;
        let (manager, _, _) = manager(&server, vec![]).await;
        let session = manager.begin_authorization(AuthorizeFlow::Full).unwrap();

        let input = ExchangeInput::AuthorizationCode {
            session_id: session.session_id.clone(),
            code: format!("code#{}", session.session_id),
        };
        let credential = manager.exchange(input.clone()).await.unwrap();
        assert_eq!(credential.secret(), "new-at");
        assert!(manager.exchange(input).await.is_err());
    }
}
