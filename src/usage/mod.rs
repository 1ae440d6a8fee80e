//! # 用量记录
//!
//! - `types`：记录与聚合结构
//! - `extract`：从 JSON 与 SSE 响应中提取 token 用量
//! - `recorder`：记录器接口与内存实现

pub mod extract;
pub mod recorder;
pub mod types;

pub use extract::{StreamUsageCollector, usage_from_json};
pub use recorder::{MemoryUsageRecorder, UsageRecorder, spawn_record};
pub use types::{ClientUsage, TokenUsage, UsageOutcome, UsageRecord};
