//! # 凭证与授权模块
//!
//! - `oauth`：Claude OAuth 协议（PKCE、授权码/setup token/sessionKey 交换、刷新）
//! - `credential_manager`：转发前的令牌新鲜度保证与单飞刷新

pub mod credential_manager;
pub mod oauth;

pub use credential_manager::{AuthorizationSession, CredentialManager, ExchangeInput};
pub use oauth::{AuthorizeFlow, OAuthClient, RefreshFailure};
