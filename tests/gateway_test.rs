//! 网关端到端测试：换账号重试、错误透传、流式中继与客户端准入

mod common;

use api_relay::store::AccountStore;
use api_relay::usage::UsageRecorder;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{CLIENT_KEY, TestApp, api_key_account, body_bytes, body_json, spawn_app};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const UPSTREAM_SONNET: &str = "claude-sonnet-4-5-20250929";

fn message_body(model: &str) -> serde_json::Value {
    json!({
        "id": "msg_1",
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{"type": "text", "text": "hi"}],
        "usage": {"input_tokens": 12, "output_tokens": 3}
    })
}

fn request(model: &str) -> serde_json::Value {
    json!({
        "model": model,
        "max_tokens": 16,
        "messages": [{"role": "user", "content": "hello"}]
    })
}

async fn wait_for_requests(app: &TestApp, expected: u64) -> api_relay::usage::ClientUsage {
    for _ in 0..50 {
        if let Some(usage) = app.usage.client_usage("tester").await.unwrap()
            && usage.requests >= expected
        {
            return usage;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("usage was not recorded");
}

#[tokio::test]
async fn test_rate_limited_account_fails_over_to_next() {
    let limited = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "120")
                .set_body_json(json!({"type": "error", "error": {"type": "rate_limit_error", "message": "slow down"}})),
        )
        .expect(1)
        .mount(&limited)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-acc-b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(message_body(UPSTREAM_SONNET)))
        .expect(1)
        .mount(&healthy)
        .await;

    let app = spawn_app(&format!(
        "{}{}",
        api_key_account("acc-a", &limited.uri()),
        api_key_account("acc-b", &healthy.uri())
    ))
    .await;

    let response = app
        .post_gateway("/v1/messages", request("claude-sonnet-4-5"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["model"], "claude-sonnet-4-5");

    let snapshot = app
        .state
        .pool
        .get("acc-a")
        .await
        .unwrap()
        .snapshot(chrono::Utc::now());
    assert!(snapshot.rate_limited);
    let stored = app.store.load_account("acc-a").await.unwrap().unwrap();
    assert!(stored.rate_limited_until.is_some());

    let usage = wait_for_requests(&app, 1).await;
    assert_eq!(usage.totals.input_tokens, 12);
    assert_eq!(usage.totals.output_tokens, 3);
}

#[tokio::test]
async fn test_single_rate_limited_account_surfaces_429() {
    let limited = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&limited)
        .await;
    let app = spawn_app(&api_key_account("acc-a", &limited.uri())).await;

    let response = app
        .post_gateway("/v1/messages", request(UPSTREAM_SONNET))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "rate_limit_error");

    // 冷却期内不会再次选中
    let response = app
        .post_gateway("/v1/messages", request(UPSTREAM_SONNET))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_matching_rule_passes_upstream_error_through() {
    let upstream = MockServer::start().await;
    let upstream_body = json!({
        "type": "error",
        "error": {"type": "invalid_request_error", "message": "prompt is too long: 210000 tokens"}
    });
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(upstream_body.clone()))
        .expect(1)
        .mount(&upstream)
        .await;

    let rules = r#"
[[seed.passthrough_rules]]
id = 1
name = "prompt too long"
priority = 5
error_codes = [400]
keywords = ["prompt is too long"]
match_mode = "all"
passthrough_code = true
passthrough_body = true
"#;
    let app = spawn_app(&format!(
        "{}{rules}",
        api_key_account("acc-a", &upstream.uri())
    ))
    .await;

    let response = app
        .post_gateway("/v1/messages", request(UPSTREAM_SONNET))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await, upstream_body);
}

#[tokio::test]
async fn test_unmatched_upstream_error_is_opaque() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database exploded at 10.0.0.3"))
        .expect(1)
        .mount(&upstream)
        .await;
    let app = spawn_app(&api_key_account("acc-a", &upstream.uri())).await;

    let response = app
        .post_gateway("/v1/messages", request(UPSTREAM_SONNET))
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_bytes(response).await;
    assert!(!String::from_utf8_lossy(&body).contains("10.0.0.3"));
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["message"], "Internal server error");
}

#[tokio::test]
async fn test_rejected_credential_fails_over_and_marks_error() {
    let rejected = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&rejected)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(message_body(UPSTREAM_SONNET)))
        .expect(1)
        .mount(&healthy)
        .await;

    let app = spawn_app(&format!(
        "{}{}",
        api_key_account("acc-a", &rejected.uri()),
        api_key_account("acc-b", &healthy.uri())
    ))
    .await;

    let response = app
        .post_gateway("/v1/messages", request(UPSTREAM_SONNET))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let account = app.state.pool.get("acc-a").await.unwrap();
    assert!(account.last_error.is_some());
}

#[tokio::test]
async fn test_streaming_response_is_relayed() {
    let sse = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4-5-20250929\",\"usage\":{\"input_tokens\":7}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":2}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("accept", "text/event-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .expect(1)
        .mount(&upstream)
        .await;
    let app = spawn_app(&api_key_account("acc-a", &upstream.uri())).await;

    let mut body = request(UPSTREAM_SONNET);
    body["stream"] = json!(true);
    let response = app.post_gateway("/v1/messages", body).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(body_bytes(response).await, sse.as_bytes());

    let usage = wait_for_requests(&app, 1).await;
    assert_eq!(usage.totals.input_tokens, 7);
    assert_eq!(usage.totals.output_tokens, 2);
}

#[tokio::test]
async fn test_count_tokens_uses_count_endpoint() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages/count_tokens"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"input_tokens": 42})))
        .expect(1)
        .mount(&upstream)
        .await;
    let app = spawn_app(&api_key_account("acc-a", &upstream.uri())).await;

    let response = app
        .post_gateway("/v1/messages/count_tokens", request("claude-haiku-4-5"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["input_tokens"], 42);
}

#[tokio::test]
async fn test_empty_pool_returns_overloaded() {
    let app = spawn_app("").await;
    let response = app
        .post_gateway("/v1/messages", request(UPSTREAM_SONNET))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "overloaded_error");
    assert_eq!(
        body["error"]["message"],
        "No upstream account is available, please retry later"
    );
}

#[tokio::test]
async fn test_gate_rejects_unknown_client() {
    let app = spawn_app("").await;
    let response = app
        .send(
            Request::post("/v1/messages")
                .header("x-api-key", "sk-unknown")
                .body(Body::from(request(UPSTREAM_SONNET).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_models_and_usage_endpoints() {
    let app = spawn_app("").await;
    let response = app
        .send(
            Request::get("/v1/models")
                .header("authorization", format!("Bearer {CLIENT_KEY}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 3);
    assert_eq!(body["has_more"], false);

    let response = app
        .send(
            Request::get("/v1/usage")
                .header("x-api-key", CLIENT_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["client_id"], "tester");
    assert_eq!(body["requests"], 0);
}

#[tokio::test]
async fn test_short_name_supported_models_accepts_short_request() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({"model": "claude-opus-4-5-20251101"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(message_body("claude-opus-4-5-20251101")))
        .expect(1)
        .mount(&upstream)
        .await;
    let account = format!(
        "{}supported_models = [\"claude-opus-4-5\"]\n",
        api_key_account("acc-a", &upstream.uri())
    );
    let app = spawn_app(&account).await;

    let response = app
        .post_gateway("/v1/messages", request("claude-opus-4-5"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["model"], "claude-opus-4-5");
}

#[tokio::test]
async fn test_streaming_short_name_is_surfaced_in_message_start() {
    let sse = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4-5-20250929\",\"usage\":{\"input_tokens\":5}}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":1}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"model": UPSTREAM_SONNET})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .expect(1)
        .mount(&upstream)
        .await;
    let app = spawn_app(&api_key_account("acc-a", &upstream.uri())).await;

    let mut body = request("claude-sonnet-4-5");
    body["stream"] = json!(true);
    let response = app.post_gateway("/v1/messages", body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let relayed = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(relayed.contains("\"model\":\"claude-sonnet-4-5\""), "{relayed}");
    assert!(!relayed.contains(UPSTREAM_SONNET), "{relayed}");
    assert!(relayed.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));

    let usage = wait_for_requests(&app, 1).await;
    assert_eq!(usage.totals.input_tokens, 5);
}
