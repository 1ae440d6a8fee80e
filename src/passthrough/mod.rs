//! # 上游错误透传
//!
//! 根据管理员配置的有序规则，决定上游错误以何种状态码和响应体返回给客户端

mod engine;
mod rules;

pub use engine::{
    DEFAULT_CUSTOM_MESSAGE, DEFAULT_ERROR_MESSAGE, ErrorPassthroughEngine, PassthroughDecision,
    first_match, ordered,
};
pub use rules::{ErrorPassthroughRule, MatchMode, UpstreamFailure};
