//! # 上游账号池调度模块
//!
//! 为每个入站请求选择一个健康的上游账号（及其绑定代理），并维护账号的限流冷却状态

pub mod pool_manager;
pub mod rate_limit;
pub mod types;

pub use pool_manager::AccountPool;
pub use rate_limit::{RateLimitTracker, is_rate_limit_signal, retry_hint};
pub use types::{PoolStats, RateLimitState, Selection, SelectionCriteria};
