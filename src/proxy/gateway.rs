//! # 网关转发管道
//!
//! 解析请求 → 归一化模型 → 选择账号 → 确保凭证新鲜 → 组装请求头 → 转发。
//! 账号相关的失败（限流、凭证、网络、401/403）在尝试次数上限内换账号重试，
//! 已尝试的账号不会再次被选中。最终失败交给错误透传引擎决定客户端看到什么。

use super::forwarder::{ForwardOutcome, RequestForwarder, UpstreamErrorResponse};
use super::relay::{RelayEnd, RelaySummary, StreamRelay};
use crate::auth::CredentialManager;
use crate::config::GatewayConfig;
use crate::error::{ProxyError, Result};
use crate::gate::ClientIdentity;
use crate::key_pool::{AccountPool, RateLimitTracker, Selection, SelectionCriteria};
use crate::logging::{LogComponent, LogStage};
use crate::passthrough::{ErrorPassthroughEngine, PassthroughDecision, UpstreamFailure};
use crate::provider::{CallKind, HeaderComposer, ModelRegistry};
use crate::store::{AccountStore, RuntimeUpdate};
use crate::types::{AccountError, AccountId, Platform};
use crate::usage::{
    TokenUsage, UsageOutcome, UsageRecord, UsageRecorder, spawn_record, usage_from_json,
};
use crate::{ldebug, linfo, lwarn};
use axum::body::Body;
use axum::http::{HeaderValue, header};
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 消息接口路径
pub const MESSAGES_PATH: &str = "/v1/messages";
/// 计数接口路径
pub const COUNT_TOKENS_PATH: &str = "/v1/messages/count_tokens";

/// 透传给客户端的上游响应头
const FORWARDED_RESPONSE_HEADERS: [&str; 2] = ["request-id", "anthropic-organization-id"];

/// 解析后的入站请求
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// 客户端请求的模型
    pub requested_model: String,
    /// 发往上游的模型
    pub upstream_model: String,
    /// 是否流式
    pub stream: bool,
    /// 是否携带工具
    pub has_tools: bool,
    /// 发往上游的请求体
    pub body: Bytes,
}

impl InboundRequest {
    /// 解析请求体并归一化模型
    pub fn parse(body: &Bytes) -> Result<Self> {
        let mut value: Value = serde_json::from_slice(body)
            .map_err(|e| ProxyError::business(format!("request body is not valid JSON: {e}")))?;
        let requested_model = value
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .ok_or_else(|| ProxyError::business("model is required"))?
            .to_string();
        let stream = value.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let has_tools = value
            .get("tools")
            .and_then(Value::as_array)
            .is_some_and(|tools| !tools.is_empty());

        let upstream_model = ModelRegistry::global()
            .normalize(&requested_model)
            .to_string();
        let body = if upstream_model == requested_model {
            body.clone()
        } else {
            value["model"] = Value::String(upstream_model.clone());
            Bytes::from(serde_json::to_vec(&value)?)
        };

        Ok(Self {
            requested_model,
            upstream_model,
            stream,
            has_tools,
            body,
        })
    }
}

/// 单次尝试的失败
enum AttemptFailure {
    Local(ProxyError),
    Upstream {
        account_id: AccountId,
        response: UpstreamErrorResponse,
        rate_limited_until: Option<DateTime<Utc>>,
    },
}

/// 网关服务
pub struct GatewayService {
    pool: Arc<AccountPool>,
    tracker: Arc<RateLimitTracker>,
    credentials: Arc<CredentialManager>,
    passthrough: Arc<ErrorPassthroughEngine>,
    store: Arc<dyn AccountStore>,
    usage: Arc<dyn UsageRecorder>,
    forwarder: RequestForwarder,
    relay: StreamRelay,
    config: GatewayConfig,
    shutdown: CancellationToken,
}

/// 网关服务依赖
pub struct GatewayDeps {
    pub pool: Arc<AccountPool>,
    pub tracker: Arc<RateLimitTracker>,
    pub credentials: Arc<CredentialManager>,
    pub passthrough: Arc<ErrorPassthroughEngine>,
    pub store: Arc<dyn AccountStore>,
    pub usage: Arc<dyn UsageRecorder>,
    pub forwarder: RequestForwarder,
    pub shutdown: CancellationToken,
}

impl GatewayService {
    /// 创建网关服务
    #[must_use]
    pub fn new(deps: GatewayDeps, config: GatewayConfig) -> Self {
        Self {
            pool: deps.pool,
            tracker: deps.tracker,
            credentials: deps.credentials,
            passthrough: deps.passthrough,
            store: deps.store,
            usage: deps.usage,
            forwarder: deps.forwarder,
            relay: StreamRelay::new(config.stream_channel_capacity),
            config,
            shutdown: deps.shutdown,
        }
    }

    /// 创建消息
    pub async fn messages(
        &self,
        request_id: &str,
        client: &ClientIdentity,
        body: Bytes,
    ) -> Result<Response> {
        let request = InboundRequest::parse(&body)?;
        self.execute(request_id, client, &request, CallKind::Messages)
            .await
    }

    /// 计数
    pub async fn count_tokens(
        &self,
        request_id: &str,
        client: &ClientIdentity,
        body: Bytes,
    ) -> Result<Response> {
        let mut request = InboundRequest::parse(&body)?;
        request.stream = false;
        self.execute(request_id, client, &request, CallKind::CountTokens)
            .await
    }

    async fn execute(
        &self,
        request_id: &str,
        client: &ClientIdentity,
        request: &InboundRequest,
        call: CallKind,
    ) -> Result<Response> {
        let mut criteria = SelectionCriteria::new(request_id, Platform::Anthropic)
            .with_model(&request.upstream_model)
            .with_group(client.group_id);
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_failure: Option<AttemptFailure> = None;

        for attempt in 1..=max_attempts {
            let selection = match self.pool.select_and_mark_used(&criteria, Utc::now()).await {
                Ok(selection) => selection,
                Err(e) if last_failure.is_none() => {
                    let outcome = UsageOutcome::Unavailable;
                    self.record_usage(request_id, client, None, request, TokenUsage::default(), outcome);
                    return Err(e);
                }
                Err(_) => break,
            };
            let account_id = selection.account.id.clone();
            criteria.exclude.insert(account_id.clone());

            ldebug!(
                request_id,
                LogStage::Scheduling,
                LogComponent::Gateway,
                "attempt",
                "选中上游账号",
                attempt = attempt,
                account_id = %account_id,
                model = %request.upstream_model
            );

            match self.attempt(request_id, &selection, request, call).await {
                Ok(ForwardOutcome::Success(response)) => {
                    self.pool.record_success(&account_id).await;
                    return self
                        .respond(request_id, client, &account_id, request, call, response)
                        .await;
                }
                Ok(ForwardOutcome::Failure(response)) => {
                    let failure = self.observe_failure(request_id, &account_id, response).await;
                    let retry = match &failure {
                        AttemptFailure::Upstream {
                            rate_limited_until,
                            response,
                            ..
                        } => rate_limited_until.is_some() || is_credential_rejected(response.status),
                        AttemptFailure::Local(_) => false,
                    };
                    if !retry {
                        return self.resolve_failure(request_id, client, request, failure).await;
                    }
                    last_failure = Some(failure);
                }
                Err(e) if e.is_account_fault() => {
                    if matches!(e.root(), ProxyError::Transport { .. }) {
                        self.note_transport_failure(&account_id, &e).await;
                    }
                    lwarn!(
                        request_id,
                        LogStage::RequestForward,
                        LogComponent::Gateway,
                        "attempt_failed",
                        "本次尝试失败，尝试其他账号",
                        attempt = attempt,
                        account_id = %account_id,
                        error = %e
                    );
                    last_failure = Some(AttemptFailure::Local(e));
                }
                Err(e) => return Err(e),
            }
        }

        match last_failure {
            Some(failure) => self.resolve_failure(request_id, client, request, failure).await,
            None => Err(ProxyError::no_eligible_account("no account could serve the request")),
        }
    }

    async fn attempt(
        &self,
        request_id: &str,
        selection: &Selection,
        request: &InboundRequest,
        call: CallKind,
    ) -> Result<ForwardOutcome> {
        let account = &selection.account;
        let credential = self
            .credentials
            .ensure_fresh(request_id, account, Utc::now())
            .await?;

        let mut headers = HeaderComposer::compose_for(
            account.platform,
            account.kind,
            call,
            &request.upstream_model,
            request.has_tools,
        )?;
        headers.extend(HeaderComposer::credential_headers(&credential)?);
        if request.stream {
            headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        }

        let path = match call {
            CallKind::Messages => MESSAGES_PATH,
            CallKind::CountTokens => COUNT_TOKENS_PATH,
        };
        self.forwarder
            .forward(request_id, selection, path, headers, request.body.clone())
            .await
    }

    async fn observe_failure(
        &self,
        request_id: &str,
        account_id: &str,
        response: UpstreamErrorResponse,
    ) -> AttemptFailure {
        let rate_limited_until = match self
            .tracker
            .observe(
                request_id,
                account_id,
                response.status,
                &response.headers,
                &response.body,
                Utc::now(),
            )
            .await
        {
            Ok(Some(until)) => {
                self.persist_runtime(account_id, RuntimeUpdate::RateLimitedUntil(until))
                    .await;
                Some(until)
            }
            Ok(None) => None,
            Err(e) => {
                lwarn!(
                    request_id,
                    LogStage::ErrorHandling,
                    LogComponent::Gateway,
                    "observe_failed",
                    "无法记录限流状态",
                    account_id = %account_id,
                    error = %e
                );
                None
            }
        };

        if is_credential_rejected(response.status) {
            self.mark_account_error(
                account_id,
                format!("upstream rejected credential with HTTP {}", response.status),
            )
            .await;
        }

        AttemptFailure::Upstream {
            account_id: account_id.to_string(),
            response,
            rate_limited_until,
        }
    }

    async fn resolve_failure(
        &self,
        request_id: &str,
        client: &ClientIdentity,
        request: &InboundRequest,
        failure: AttemptFailure,
    ) -> Result<Response> {
        match failure {
            AttemptFailure::Local(e) => {
                let outcome = if matches!(e.root(), ProxyError::Transport { .. }) {
                    UsageOutcome::TransportError
                } else {
                    UsageOutcome::Unavailable
                };
                self.record_usage(request_id, client, None, request, TokenUsage::default(), outcome);
                Err(e)
            }
            AttemptFailure::Upstream {
                account_id,
                response,
                rate_limited_until,
            } => {
                self.record_usage(
                    request_id,
                    client,
                    Some(account_id.clone()),
                    request,
                    TokenUsage::default(),
                    UsageOutcome::UpstreamError {
                        status: response.status,
                    },
                );
                let failure =
                    UpstreamFailure::new(response.status, &response.body, Platform::Anthropic);
                if let Some(decision) = self.passthrough.evaluate(&failure).await {
                    linfo!(
                        request_id,
                        LogStage::ErrorHandling,
                        LogComponent::Passthrough,
                        "rule_matched",
                        "上游错误命中透传规则",
                        rule_id = ?decision.rule_id,
                        upstream_status = response.status,
                        status = decision.status.as_u16()
                    );
                    return Ok(decision_response(decision));
                }
                if let Some(until) = rate_limited_until {
                    return Err(ProxyError::UpstreamRateLimited { account_id, until });
                }
                Err(ProxyError::Upstream {
                    status: response.status,
                    body: response.body,
                })
            }
        }
    }

    async fn respond(
        &self,
        request_id: &str,
        client: &ClientIdentity,
        account_id: &str,
        request: &InboundRequest,
        call: CallKind,
        upstream: reqwest::Response,
    ) -> Result<Response> {
        let status = upstream.status();
        let mut builder = Response::builder().status(status.as_u16());
        for name in FORWARDED_RESPONSE_HEADERS {
            if let Some(value) = upstream.headers().get(name) {
                builder = builder.header(name, value.as_bytes());
            }
        }

        if request.stream && call == CallKind::Messages {
            let usage = Arc::clone(&self.usage);
            let record = self.usage_record(
                request_id,
                client,
                Some(account_id.to_string()),
                request,
                TokenUsage::default(),
                UsageOutcome::Success,
            );
            let body = self.relay.relay(
                request_id.to_string(),
                upstream,
                self.shutdown.child_token(),
                request.requested_model != request.upstream_model,
                move |summary: RelaySummary| {
                    let outcome = match summary.end {
                        RelayEnd::Completed => UsageOutcome::Success,
                        RelayEnd::UpstreamFailed(_) => UsageOutcome::TransportError,
                        RelayEnd::ClientGone | RelayEnd::Cancelled => UsageOutcome::Cancelled,
                    };
                    spawn_record(
                        usage,
                        UsageRecord {
                            usage: summary.usage,
                            outcome,
                            ..record
                        },
                    );
                },
            );
            return builder
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(body)
                .map_err(|e| ProxyError::internal_with_source("failed to build stream response", e));
        }

        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/json"));
        let body = upstream.bytes().await.map_err(|e| {
            ProxyError::transport_with_source("failed to read upstream response body", e)
        })?;

        let body = if call == CallKind::Messages {
            let usage = usage_from_json(&body).map(|(_, usage)| usage).unwrap_or_default();
            self.record_usage(
                request_id,
                client,
                Some(account_id.to_string()),
                request,
                usage,
                UsageOutcome::Success,
            );
            surface_model(body, request)
        } else {
            body
        };

        builder
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .map_err(|e| ProxyError::internal_with_source("failed to build response", e))
    }

    async fn note_transport_failure(&self, account_id: &str, error: &ProxyError) {
        let threshold = self.config.transport_failure_threshold;
        match self
            .pool
            .record_transport_failure(account_id, &error.to_string(), threshold, Utc::now())
            .await
        {
            Ok(failures) if threshold > 0 && failures >= threshold => {
                if let Some(account) = self.pool.get(account_id).await
                    && let Some(last_error) = account.last_error
                {
                    self.persist_runtime(account_id, RuntimeUpdate::Error(last_error))
                        .await;
                }
            }
            Ok(_) => {}
            Err(e) => lwarn!(
                "system",
                LogStage::ErrorHandling,
                LogComponent::KeyPool,
                "transport_failure_untracked",
                "无法记录网络失败",
                account_id = %account_id,
                error = %e
            ),
        }
    }

    async fn mark_account_error(&self, account_id: &str, message: String) {
        let at = Utc::now();
        if self
            .pool
            .set_last_error(account_id, message.clone(), at)
            .await
            .is_ok()
        {
            self.persist_runtime(account_id, RuntimeUpdate::Error(AccountError { message, at }))
                .await;
        }
    }

    async fn persist_runtime(&self, account_id: &str, update: RuntimeUpdate) {
        if let Err(e) = self.store.save_runtime(account_id, update).await {
            lwarn!(
                "system",
                LogStage::ErrorHandling,
                LogComponent::Store,
                "persist_runtime_failed",
                "无法持久化账号运行状态",
                account_id = %account_id,
                error = %e
            );
        }
    }

    fn usage_record(
        &self,
        request_id: &str,
        client: &ClientIdentity,
        account_id: Option<AccountId>,
        request: &InboundRequest,
        usage: TokenUsage,
        outcome: UsageOutcome,
    ) -> UsageRecord {
        UsageRecord {
            request_id: request_id.to_string(),
            client_id: client.client_id.clone(),
            account_id,
            model: request.upstream_model.clone(),
            usage,
            outcome,
            stream: request.stream,
            at: Utc::now(),
        }
    }

    fn record_usage(
        &self,
        request_id: &str,
        client: &ClientIdentity,
        account_id: Option<AccountId>,
        request: &InboundRequest,
        usage: TokenUsage,
        outcome: UsageOutcome,
    ) {
        let record = self.usage_record(request_id, client, account_id, request, usage, outcome);
        spawn_record(Arc::clone(&self.usage), record);
    }
}

/// 上游拒绝了凭证本身
const fn is_credential_rejected(status: u16) -> bool {
    matches!(status, 401 | 403)
}

/// 客户端使用短模型名时，把响应中的模型ID还原为短名
fn surface_model(body: Bytes, request: &InboundRequest) -> Bytes {
    if request.requested_model == request.upstream_model {
        return body;
    }
    let Ok(mut value) = serde_json::from_slice::<Value>(&body) else {
        return body;
    };
    let Some(model) = value.get("model").and_then(Value::as_str) else {
        return body;
    };
    let surfaced = ModelRegistry::global().denormalize(model).to_string();
    value["model"] = Value::String(surfaced);
    serde_json::to_vec(&value).map_or(body, Bytes::from)
}

fn decision_response(decision: PassthroughDecision) -> Response {
    let mut response = Response::new(Body::from(decision.body));
    *response.status_mut() = decision.status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
