//! # 共享状态
//!
//! 网关与管理端共用的服务集合，启动时按配置组装一次。

use super::forwarder::RequestForwarder;
use super::gateway::{GatewayDeps, GatewayService};
use super::http_client::HttpClientPool;
use crate::auth::{CredentialManager, OAuthClient};
use crate::config::{AppConfig, ConfigManager};
use crate::error::Result;
use crate::gate::StaticKeyGate;
use crate::key_pool::{AccountPool, RateLimitTracker};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::passthrough::ErrorPassthroughEngine;
use crate::store::AccountStore;
use crate::usage::UsageRecorder;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::ops::Deref;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 服务集合
pub struct AppServices {
    pub config: ConfigManager,
    pub store: Arc<dyn AccountStore>,
    pub pool: Arc<AccountPool>,
    pub tracker: Arc<RateLimitTracker>,
    pub credentials: Arc<CredentialManager>,
    pub passthrough: Arc<ErrorPassthroughEngine>,
    pub usage: Arc<dyn UsageRecorder>,
    pub gate: Arc<StaticKeyGate>,
    pub clients: Arc<HttpClientPool>,
    pub gateway: GatewayService,
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
}

/// 重新加载的结果
#[derive(Debug, Clone, Serialize)]
pub struct ReloadSummary {
    /// 池中账号数
    pub accounts: usize,
    /// 规则数
    pub rules: usize,
    /// 客户端密钥数
    pub clients: usize,
}

/// 应用共享状态
#[derive(Clone)]
pub struct AppState {
    services: Arc<AppServices>,
}

impl AppState {
    /// 按配置与存储组装全部服务，并从存储加载账号池与规则
    pub async fn build(
        config: ConfigManager,
        store: Arc<dyn AccountStore>,
        usage: Arc<dyn UsageRecorder>,
    ) -> Result<Self> {
        let app_config: AppConfig = config.get_config().await;
        let clients = Arc::new(HttpClientPool::new(&app_config.gateway));
        let pool = Arc::new(AccountPool::new());
        let tracker = Arc::new(RateLimitTracker::new(
            Arc::clone(&pool),
            app_config.rate_limit.clone(),
        ));
        let credentials = Arc::new(CredentialManager::new(
            OAuthClient::new(clients.direct()?, app_config.oauth.clone()),
            Arc::clone(&pool),
            Arc::clone(&store),
        ));
        let passthrough = Arc::new(ErrorPassthroughEngine::default());
        let shutdown = CancellationToken::new();

        let gateway = GatewayService::new(
            GatewayDeps {
                pool: Arc::clone(&pool),
                tracker: Arc::clone(&tracker),
                credentials: Arc::clone(&credentials),
                passthrough: Arc::clone(&passthrough),
                store: Arc::clone(&store),
                usage: Arc::clone(&usage),
                forwarder: RequestForwarder::new(Arc::clone(&clients), &app_config.gateway),
                shutdown: shutdown.clone(),
            },
            app_config.gateway.clone(),
        );

        let state = Self {
            services: Arc::new(AppServices {
                config,
                store,
                pool,
                tracker,
                credentials,
                passthrough,
                usage,
                gate: Arc::new(StaticKeyGate::new(app_config.clients)),
                clients,
                gateway,
                shutdown,
                started_at: Utc::now(),
            }),
        };
        state.sync_from_store().await?;
        Ok(state)
    }

    /// 从存储重新读取账号、代理与规则；账号运行时状态保留
    pub async fn sync_from_store(&self) -> Result<ReloadSummary> {
        let records = self.store.load_accounts().await?;
        let proxies = self.store.load_proxies().await?;
        let rules = self.store.load_rules().await?;

        let accounts = self.pool.load(records, proxies).await?;
        let rule_count = rules.len();
        self.passthrough.replace_rules(rules).await;
        self.clients.clear();

        Ok(ReloadSummary {
            accounts,
            rules: rule_count,
            clients: 0,
        })
    }

    /// 重新读取配置文件中的客户端密钥，并同步存储
    pub async fn reload(&self) -> Result<ReloadSummary> {
        let config = self.config.reload().await?;
        let clients = config.clients.iter().filter(|client| client.enabled).count();
        self.gate.replace(config.clients).await;
        let summary = ReloadSummary {
            clients,
            ..self.sync_from_store().await?
        };
        linfo!(
            "system",
            LogStage::Management,
            LogComponent::Management,
            "reloaded",
            "配置与存储已重新加载",
            accounts = summary.accounts,
            rules = summary.rules,
            clients = summary.clients
        );
        Ok(summary)
    }
}

impl Deref for AppState {
    type Target = AppServices;

    fn deref(&self) -> &Self::Target {
        &self.services
    }
}
