//! # 网关路由
//!
//! Claude 兼容的客户端接口，除 `/health` 外都需要通过客户端准入。

use super::gateway::{COUNT_TOKENS_PATH, MESSAGES_PATH};
use super::state::AppState;
use crate::error::Result;
use crate::gate::{ClientGate, ClientIdentity, client_gate_middleware};
use crate::logging::{LogComponent, LogStage};
use crate::provider::ModelRegistry;
use crate::usage::ClientUsage;
use crate::{linfo, lwarn};
use axum::extract::{DefaultBodyLimit, Extension, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

/// 请求ID：优先使用客户端传入的 `x-request-id`
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string)
}

/// 网关路由
pub fn gateway_router(state: AppState, body_limit: usize) -> Router {
    let gate: Arc<dyn ClientGate> = state.gate.clone();
    let protected = Router::new()
        .route(MESSAGES_PATH, post(create_message))
        .route(COUNT_TOKENS_PATH, post(count_tokens))
        .route("/v1/models", get(list_models))
        .route("/v1/usage", get(client_usage))
        .layer(axum::middleware::from_fn_with_state(gate, client_gate_middleware))
        .layer(DefaultBodyLimit::max(body_limit));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn create_message(
    State(state): State<AppState>,
    Extension(client): Extension<ClientIdentity>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let request_id = request_id(&headers);
    let started = Instant::now();
    let result = state.gateway.messages(&request_id, &client, body).await;
    log_outcome(&request_id, &client, "messages", started, &result);
    result
}

async fn count_tokens(
    State(state): State<AppState>,
    Extension(client): Extension<ClientIdentity>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let request_id = request_id(&headers);
    let started = Instant::now();
    let result = state.gateway.count_tokens(&request_id, &client, body).await;
    log_outcome(&request_id, &client, "count_tokens", started, &result);
    result
}

fn log_outcome(
    request_id: &str,
    client: &ClientIdentity,
    operation: &str,
    started: Instant,
    result: &Result<Response>,
) {
    match result {
        Ok(response) => linfo!(
            request_id,
            LogStage::RequestForward,
            LogComponent::Gateway,
            operation,
            "请求完成",
            client_id = %client.client_id,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis()
        ),
        Err(e) => lwarn!(
            request_id,
            LogStage::ErrorHandling,
            LogComponent::Gateway,
            operation,
            "请求失败",
            client_id = %client.client_id,
            error = %e,
            retryable = e.is_retryable(),
            elapsed_ms = started.elapsed().as_millis()
        ),
    }
}

async fn list_models() -> Json<serde_json::Value> {
    let data = ModelRegistry::global().default_catalogue();
    Json(serde_json::json!({
        "data": data,
        "has_more": false,
        "first_id": data.first().map(|model| model.id),
        "last_id": data.last().map(|model| model.id),
    }))
}

async fn client_usage(
    State(state): State<AppState>,
    Extension(client): Extension<ClientIdentity>,
) -> Result<Json<ClientUsage>> {
    let usage = state
        .usage
        .client_usage(&client.client_id)
        .await?
        .unwrap_or_else(|| ClientUsage {
            client_id: client.client_id.clone(),
            ..ClientUsage::default()
        });
    Ok(Json(usage))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let now = Utc::now();
    let stats = state.pool.stats(now).await;
    Json(serde_json::json!({
        "status": if stats.schedulable > stats.rate_limited { "ok" } else { "degraded" },
        "accounts": stats,
        "uptime_secs": (now - state.started_at).num_seconds(),
    }))
}
