//! # 管理端认证中间件
//!
//! 校验 `Authorization: Bearer <admin_token>`；未配置令牌时拒绝所有请求。

use super::response;
use crate::lwarn;
use crate::logging::{LogComponent, LogStage};
use crate::proxy::AppState;
use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};

/// 从 `Authorization` 头中取出 Bearer 令牌
fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// 固定时间比较
fn token_matches(expected: &str, provided: &str) -> bool {
    let (a, b) = (expected.as_bytes(), provided.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Axum 管理端认证中间件
pub async fn admin_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let expected = state.config.get_config().await.server.admin_token;
    let Some(expected) = expected.filter(|token| !token.is_empty()) else {
        return response::error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ADMIN_DISABLED",
            "admin token is not configured",
        );
    };

    match bearer_token(&request) {
        Some(token) if token_matches(&expected, token) => next.run(request).await,
        _ => {
            lwarn!(
                "system",
                LogStage::Authentication,
                LogComponent::Management,
                "admin_auth_failed",
                "管理端令牌校验失败",
                path = %request.uri().path()
            );
            response::error(StatusCode::UNAUTHORIZED, "AUTH_ERROR", "invalid admin token")
        }
    }
}
