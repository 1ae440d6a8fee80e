//! # 请求转发器
//!
//! 把组装好的请求发往账号的上游地址。只对响应头设置超时；
//! 非 2xx 响应的响应体被有限读取，交给错误透传引擎处理。

use super::http_client::HttpClientPool;
use crate::config::GatewayConfig;
use crate::error::{ProxyError, Result};
use crate::key_pool::Selection;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 上游返回的非 2xx 响应
#[derive(Debug, Clone)]
pub struct UpstreamErrorResponse {
    /// 状态码
    pub status: u16,
    /// 响应头
    pub headers: HeaderMap,
    /// 截断后的响应体
    pub body: Bytes,
}

/// 一次转发的结果
#[derive(Debug)]
pub enum ForwardOutcome {
    /// 2xx，响应体尚未读取
    Success(reqwest::Response),
    /// 非 2xx
    Failure(UpstreamErrorResponse),
}

/// 请求转发器
#[derive(Debug)]
pub struct RequestForwarder {
    clients: Arc<HttpClientPool>,
    header_timeout: Duration,
    error_body_limit: usize,
}

impl RequestForwarder {
    /// 创建转发器
    #[must_use]
    pub fn new(clients: Arc<HttpClientPool>, config: &GatewayConfig) -> Self {
        Self {
            clients,
            header_timeout: config.response_header_timeout(),
            error_body_limit: config.error_body_limit,
        }
    }

    /// 发送请求并等待响应头
    pub async fn forward(
        &self,
        request_id: &str,
        selection: &Selection,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ForwardOutcome> {
        let account = &selection.account;
        let client = self.clients.client_for(selection.proxy.as_ref())?;
        let url = format!("{}{}", account.base_url, path);
        let started = Instant::now();

        ldebug!(
            request_id,
            LogStage::RequestForward,
            LogComponent::Forwarder,
            "forward",
            "转发请求到上游",
            account_id = %account.id,
            url = %url,
            proxy = %selection.proxy.as_ref().map_or("direct", |proxy| proxy.id.as_str())
        );

        let send = client.post(&url).headers(headers).body(body).send();
        let response = match tokio::time::timeout(self.header_timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(ProxyError::transport_with_source(
                    format!("request to {url} failed"),
                    e,
                ));
            }
            Err(_) => {
                return Err(ProxyError::transport(format!(
                    "upstream did not send response headers within {}s",
                    self.header_timeout.as_secs()
                )));
            }
        };

        let status = response.status();
        if status.is_success() {
            ldebug!(
                request_id,
                LogStage::RequestForward,
                LogComponent::Forwarder,
                "upstream_headers",
                "收到上游响应头",
                account_id = %account.id,
                status = status.as_u16(),
                elapsed_ms = started.elapsed().as_millis()
            );
            return Ok(ForwardOutcome::Success(response));
        }

        let headers = response.headers().clone();
        let body = read_bounded(response, self.error_body_limit).await;
        lwarn!(
            request_id,
            LogStage::RequestForward,
            LogComponent::Forwarder,
            "upstream_error",
            "上游返回错误",
            account_id = %account.id,
            status = status.as_u16(),
            body_len = body.len()
        );
        Ok(ForwardOutcome::Failure(UpstreamErrorResponse {
            status: status.as_u16(),
            headers,
            body,
        }))
    }
}

/// 最多读取 `limit` 字节，读取出错时返回已读部分
pub async fn read_bounded(response: reqwest::Response, limit: usize) -> Bytes {
    let mut stream = response.bytes_stream();
    let mut buffer = BytesMut::new();
    while let Some(Ok(chunk)) = stream.next().await {
        let remaining = limit.saturating_sub(buffer.len());
        if chunk.len() >= remaining {
            buffer.extend_from_slice(&chunk[..remaining]);
            break;
        }
        buffer.extend_from_slice(&chunk);
    }
    buffer.freeze()
}
