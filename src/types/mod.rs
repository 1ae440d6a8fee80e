//! # 领域类型
//!
//! 上游账号、凭证与代理的数据模型

pub mod account;
pub mod proxy;

pub use account::{
    Account, AccountError, AccountKind, AccountRecord, AccountSnapshot, Credential, OAuthTokens,
    Platform, RecordKind,
};
pub use proxy::{Proxy, ProxyStatus};

/// 账号ID
pub type AccountId = String;
/// 代理ID
pub type ProxyId = String;
/// 分组ID
pub type GroupId = i64;
