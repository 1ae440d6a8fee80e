//! # 错误处理测试

use crate::error::{Context, ProxyError};
use axum::http::StatusCode;
use std::error::Error;

#[test]
fn test_config_error_with_source() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "文件不存在");
    let err = ProxyError::config_with_source("配置文件加载失败", io_err);

    assert!(matches!(err, ProxyError::Config { .. }));
    assert!(err.to_string().contains("配置错误: 配置文件加载失败"));
    assert!(err.source().is_some());
}

#[test]
fn test_context_keeps_root_classification() {
    let result: Result<(), ProxyError> = Err(ProxyError::transport("connection reset"));
    let err = result.context("转发请求").unwrap_err();

    assert!(matches!(err, ProxyError::Context { .. }));
    assert!(matches!(err.root(), ProxyError::Transport { .. }));
    assert!(err.is_retryable());
    assert_eq!(err.to_http_response_parts().0, StatusCode::BAD_GATEWAY);
}

#[test]
fn test_taxonomy_status_mapping() {
    let cases = [
        (ProxyError::no_eligible_account("pool empty"), StatusCode::SERVICE_UNAVAILABLE),
        (
            ProxyError::credential_refresh_failed("acc-1", "invalid_grant"),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        (
            ProxyError::UpstreamRateLimited {
                account_id: "acc-1".to_string(),
                until: chrono::Utc::now(),
            },
            StatusCode::TOO_MANY_REQUESTS,
        ),
        (ProxyError::auth("missing key"), StatusCode::UNAUTHORIZED),
        (ProxyError::business("bad body"), StatusCode::BAD_REQUEST),
        (ProxyError::not_found("account", "x"), StatusCode::NOT_FOUND),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_http_response_parts().0, expected, "{err}");
    }
}

#[test]
fn test_account_fault_classification() {
    assert!(ProxyError::credential_refresh_failed("a", "b").is_account_fault());
    assert!(!ProxyError::no_eligible_account("none").is_account_fault());
    assert!(ProxyError::no_eligible_account("none").is_retryable());
    assert!(!ProxyError::business("bad").is_retryable());
}

#[test]
fn test_auto_conversion_from_toml_error() {
    let toml_err = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
    let proxy_err: ProxyError = toml_err.into();

    assert!(matches!(proxy_err, ProxyError::Config { .. }));
    assert!(proxy_err.to_string().contains("配置错误: TOML解析失败"));
}

#[test]
fn test_business_error_macro() {
    let err = crate::business_error!("字段 {} 缺失", "model");
    assert_eq!(err.to_string(), "业务错误: 字段 model 缺失");
}

#[tokio::test]
async fn test_unmatched_upstream_error_is_masked_for_clients() {
    use axum::response::IntoResponse;

    let err = ProxyError::Upstream {
        status: 502,
        body: bytes::Bytes::from_static(b"<html>db at 10.0.0.3 down</html>"),
    };
    assert!(err.to_string().contains("10.0.0.3"));

    let response = err.into_response();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["type"], "api_error");
    assert_eq!(body["error"]["message"], "Internal server error");
}

#[test]
fn test_client_messages_are_stable_english() {
    let cases = [
        (
            ProxyError::no_eligible_account("no schedulable anthropic account available"),
            "No upstream account is available, please retry later",
        ),
        (
            ProxyError::transport("connection reset by 10.0.0.3"),
            "Upstream connection failed, please retry later",
        ),
        (ProxyError::auth("invalid client key"), "invalid client key"),
        (ProxyError::business("model is required"), "model is required"),
        (ProxyError::not_found("account", "acc-1"), "account acc-1 not found"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.client_message(), expected);
    }

    let wrapped: Result<(), ProxyError> = Err(ProxyError::no_eligible_account("pool empty"));
    let wrapped = wrapped.context("选择账号").unwrap_err();
    assert_eq!(
        wrapped.client_message(),
        "No upstream account is available, please retry later"
    );
}
