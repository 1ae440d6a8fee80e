//! # 系统操作处理器

use crate::management::response;
use crate::proxy::AppState;
use axum::extract::State;
use axum::response::Response;

/// 重新读取配置文件与存储
pub async fn reload(State(state): State<AppState>) -> Response {
    response::from_result(state.reload().await, "配置已重新加载")
}
