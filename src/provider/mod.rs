//! Upstream provider protocol module。
//!
//! - `models`：短模型名与上游模型ID的双向映射、默认模型目录
//! - `headers`：按平台、凭证类型、模型与工具使用组装上游协议头

mod headers;
mod models;

pub use headers::{
    ANTHROPIC_VERSION, BETA_CLAUDE_CODE, BETA_FINE_GRAINED_TOOL_STREAMING,
    BETA_INTERLEAVED_THINKING, BETA_OAUTH, BETA_TOKEN_COUNTING, BetaProfile, CLI_USER_AGENT,
    CallKind, HeaderComposer,
};
pub use models::{Model, ModelRegistry};
