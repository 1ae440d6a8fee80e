//! # 路由配置
//!
//! 管理端路由，全部挂在 `/admin` 下并要求管理员令牌

use super::handlers::{accounts, oauth, rules, system};
use super::middleware::admin_auth;
use crate::proxy::AppState;
use axum::Router;
use axum::routing::{get, post, put};

/// 创建管理端路由
pub fn admin_router(state: AppState) -> Router {
    let routes = Router::new()
        .nest("/accounts", account_routes())
        .nest("/error-passthrough-rules", rule_routes())
        .nest("/oauth", oauth_routes())
        .route("/reload", post(system::reload))
        .layer(axum::middleware::from_fn_with_state(state.clone(), admin_auth));

    Router::new().nest("/admin", routes).with_state(state)
}

/// 账号管理路由
fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(accounts::list_accounts))
        .route("/{id}", axum::routing::delete(accounts::delete_account))
        .route("/{id}/schedulable", post(accounts::set_schedulable))
        .route("/{id}/clear-error", post(accounts::clear_error))
        .route("/{id}/clear-rate-limit", post(accounts::clear_rate_limit))
        .route("/{id}/refresh", post(accounts::refresh_credential))
}

/// 错误透传规则路由
fn rule_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(rules::list_rules).post(rules::create_rule))
        .route("/{id}", put(rules::update_rule).delete(rules::delete_rule))
}

/// OAuth 接入路由
fn oauth_routes() -> Router<AppState> {
    Router::new()
        .route("/authorize-url", post(oauth::authorize_url))
        .route("/exchange", post(oauth::exchange))
}
