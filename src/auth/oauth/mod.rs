//! # Claude OAuth
//!
//! - `pkce`：PKCE 参数生成与校验
//! - `nested_id`：响应中组织/账号 ID 的多种形状
//! - `token_exchange`：授权码、setup token、sessionKey 交换与令牌刷新

pub mod nested_id;
pub mod pkce;
pub mod token_exchange;

pub use nested_id::{NestedId, extract_id};
pub use pkce::{CHALLENGE_METHOD, PkceParams};
pub use token_exchange::{
    AuthorizeFlow, AuthorizeRequest, OAuthClient, RefreshFailure, SETUP_TOKEN_EXPIRES_IN,
    TokenResponse, code_from_redirect, strip_fragment,
};
