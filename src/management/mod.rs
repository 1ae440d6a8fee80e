//! # 管理API模块
//!
//! 运维账号池、错误透传规则与 OAuth 账号接入的 REST 接口

pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

pub use routes::admin_router;
