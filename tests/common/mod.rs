//! 集成测试公共工具
#![allow(dead_code)]

use api_relay::config::ConfigManager;
use api_relay::store::{AccountStore, MemoryStore};
use api_relay::usage::{MemoryUsageRecorder, UsageRecorder};
use api_relay::{AppState, management::admin_router, proxy::gateway_router};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tower::ServiceExt;

pub const CLIENT_KEY: &str = "sk-relay-test";
pub const ADMIN_TOKEN: &str = "admin-test-token";

/// 运行中的测试应用
pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub usage: Arc<MemoryUsageRecorder>,
    pub config_file: NamedTempFile,
}

/// 一个指向 `base_url` 的 API Key 账号
pub fn api_key_account(id: &str, base_url: &str) -> String {
    format!(
        r#"
[[seed.accounts]]
id = "{id}"
platform = "anthropic"
kind = "apikey"
base_url = "{base_url}"
credential = {{ type = "api_key", api_key = "sk-{id}" }}
"#
    )
}

/// 基础配置，附加 `extra` 片段
pub fn config_toml(extra: &str) -> String {
    format!(
        r#"
[server]
host = "127.0.0.1"
port = 18080
admin_token = "{ADMIN_TOKEN}"

[gateway]
max_attempts = 3
stream_channel_capacity = 4

[[clients]]
key = "{CLIENT_KEY}"
name = "tester"
{extra}
"#
    )
}

pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// 按配置片段启动应用
pub async fn spawn_app(extra: &str) -> TestApp {
    let config_file = write_config(&config_toml(extra));
    let manager =
        ConfigManager::from_file_with_overrides(config_file.path(), HashMap::new()).unwrap();
    let seed = manager.get_config().await.seed;

    let store = Arc::new(MemoryStore::from_seed(seed));
    let usage = Arc::new(MemoryUsageRecorder::new());
    let state = AppState::build(
        manager,
        Arc::clone(&store) as Arc<dyn AccountStore>,
        Arc::clone(&usage) as Arc<dyn UsageRecorder>,
    )
    .await
    .unwrap();

    let router = gateway_router(state.clone(), 1024 * 1024).merge(admin_router(state.clone()));
    TestApp {
        state,
        router,
        store,
        usage,
        config_file,
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// 以测试客户端身份调用网关
    pub async fn post_gateway(&self, path: &str, body: serde_json::Value) -> Response<Body> {
        self.send(
            Request::post(path)
                .header("x-api-key", CLIENT_KEY)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    /// 以管理员身份调用管理端
    pub async fn admin(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Response<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(path)
            .header("authorization", format!("Bearer {ADMIN_TOKEN}"));
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        };
        self.send(request.unwrap()).await
    }
}

pub async fn body_bytes(response: Response<Body>) -> bytes::Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
