//! # 网关模块
//!
//! - `http_client`：按出口缓存的上游 HTTP 客户端
//! - `forwarder`：单次上游调用与错误响应捕获
//! - `relay`：流式响应中继与取消
//! - `gateway`：选择、刷新、组装、转发与换账号重试
//! - `routes`：Claude 兼容的 HTTP 接口
//! - `state`：共享服务集合

pub mod forwarder;
pub mod gateway;
pub mod http_client;
pub mod relay;
pub mod routes;
pub mod state;

pub use forwarder::{ForwardOutcome, RequestForwarder, UpstreamErrorResponse};
pub use gateway::{COUNT_TOKENS_PATH, GatewayService, InboundRequest, MESSAGES_PATH};
pub use http_client::HttpClientPool;
pub use relay::{RelayEnd, RelaySummary, StreamRelay};
pub use routes::gateway_router;
pub use state::{AppServices, AppState, ReloadSummary};
