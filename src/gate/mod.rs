//! # 客户端准入
//!
//! 网关入口的客户端密钥校验。通过的请求在扩展中携带 [`ClientIdentity`]，
//! 后续的调度按其分组过滤账号。

use crate::config::ClientKeyConfig;
use crate::error::ProxyError;
use crate::logging::{LogComponent, LogStage, mask_secret};
use crate::types::GroupId;
use crate::{ldebug, lwarn};
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 通过准入的客户端
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// 客户端名称，用于用量统计
    pub client_id: String,
    /// 所属分组
    pub group_id: Option<GroupId>,
}

/// 准入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// 允许
    Allowed(ClientIdentity),
    /// 拒绝及原因
    Denied(String),
}

/// 客户端准入接口
#[async_trait]
pub trait ClientGate: Send + Sync {
    /// 校验客户端密钥
    async fn authorize(&self, api_key: &str) -> GateDecision;
}

/// 基于配置文件中静态密钥的准入
#[derive(Debug, Default)]
pub struct StaticKeyGate {
    keys: RwLock<HashMap<String, ClientKeyConfig>>,
}

impl StaticKeyGate {
    /// 由配置创建
    #[must_use]
    pub fn new(clients: Vec<ClientKeyConfig>) -> Self {
        Self {
            keys: RwLock::new(index(clients)),
        }
    }

    /// 配置重载后替换全部密钥
    pub async fn replace(&self, clients: Vec<ClientKeyConfig>) {
        *self.keys.write().await = index(clients);
    }
}

fn index(clients: Vec<ClientKeyConfig>) -> HashMap<String, ClientKeyConfig> {
    clients
        .into_iter()
        .filter(|client| !client.key.is_empty())
        .map(|client| (client.key.clone(), client))
        .collect()
}

#[async_trait]
impl ClientGate for StaticKeyGate {
    async fn authorize(&self, api_key: &str) -> GateDecision {
        match self.keys.read().await.get(api_key) {
            Some(client) if client.enabled => GateDecision::Allowed(ClientIdentity {
                client_id: client.name.clone(),
                group_id: client.group_id,
            }),
            Some(_) => GateDecision::Denied("client key is disabled".to_string()),
            None => GateDecision::Denied("invalid client key".to_string()),
        }
    }
}

/// 从 `x-api-key` 或 `Authorization: Bearer` 中取出客户端密钥
#[must_use]
pub fn extract_client_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// 网关准入中间件
pub async fn client_gate_middleware(
    State(gate): State<Arc<dyn ClientGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(key) = extract_client_key(request.headers()).map(str::to_string) else {
        return ProxyError::auth("missing client API key").into_response();
    };

    match gate.authorize(&key).await {
        GateDecision::Allowed(identity) => {
            ldebug!(
                "system",
                LogStage::Authentication,
                LogComponent::ClientGate,
                "client_allowed",
                "客户端通过准入",
                client_id = %identity.client_id
            );
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        GateDecision::Denied(reason) => {
            lwarn!(
                "system",
                LogStage::Authentication,
                LogComponent::ClientGate,
                "client_denied",
                "客户端被拒绝",
                key = %mask_secret(&key),
                reason = %reason
            );
            ProxyError::auth(reason).into_response()
        }
    }
}
