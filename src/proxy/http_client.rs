//! # 上游 HTTP 客户端池
//!
//! 每个出口（直连或某个代理）复用一个 `reqwest::Client`。
//! 不设置总超时，流式响应可以持续很久；连接阶段与空闲连接有超时。

use crate::config::GatewayConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage, mask_secret};
use crate::ldebug;
use crate::types::Proxy;
use dashmap::DashMap;
use reqwest::Client;
use std::time::Duration;

const DIRECT: &str = "direct";

/// 出口客户端池
#[derive(Debug)]
pub struct HttpClientPool {
    clients: DashMap<String, Client>,
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
}

impl HttpClientPool {
    /// 按网关配置创建
    #[must_use]
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            clients: DashMap::new(),
            connect_timeout: config.connect_timeout(),
            pool_idle_timeout: config.pool_idle_timeout(),
        }
    }

    /// 直连客户端
    pub fn direct(&self) -> Result<Client> {
        self.client_for(None)
    }

    /// 指定出口的客户端，首次使用时创建
    pub fn client_for(&self, proxy: Option<&Proxy>) -> Result<Client> {
        let key = proxy.map_or(DIRECT, |proxy| proxy.id.as_str());
        if let Some(client) = self.clients.get(key) {
            return Ok(client.clone());
        }

        let client = self.build(proxy)?;
        Ok(self
            .clients
            .entry(key.to_string())
            .or_insert(client)
            .clone())
    }

    /// 丢弃全部代理客户端
    pub fn clear(&self) {
        self.clients.retain(|key, _| key == DIRECT);
    }

    fn build(&self, proxy: Option<&Proxy>) -> Result<Client> {
        let mut builder = Client::builder()
            .connect_timeout(self.connect_timeout)
            .pool_idle_timeout(Some(self.pool_idle_timeout))
            .tcp_keepalive(Some(Duration::from_secs(30)));

        match proxy {
            Some(proxy) => {
                if !proxy.has_supported_scheme() {
                    return Err(ProxyError::config(format!(
                        "proxy {} has unsupported address {}",
                        proxy.id, proxy.address
                    )));
                }
                let mut upstream = reqwest::Proxy::all(&proxy.address).map_err(|e| {
                    ProxyError::config_with_source(format!("invalid proxy {}", proxy.id), e)
                })?;
                if let Some(username) = proxy.username.as_deref() {
                    upstream =
                        upstream.basic_auth(username, proxy.password.as_deref().unwrap_or_default());
                }
                builder = builder.proxy(upstream);
                ldebug!(
                    "system",
                    LogStage::RequestForward,
                    LogComponent::Forwarder,
                    "build_proxy_client",
                    "创建代理出口客户端",
                    proxy_id = %proxy.id,
                    username = %proxy.username.as_deref().map(mask_secret).unwrap_or_default()
                );
            }
            None => builder = builder.no_proxy(),
        }

        builder
            .build()
            .map_err(|e| ProxyError::internal_with_source("failed to build HTTP client", e))
    }
}
