//! # 流式响应中继
//!
//! 后台任务把上游字节流逐块写入有界通道，axum 以通道作为响应体。
//! 客户端断开（通道关闭）或取消令牌触发时，任务立即丢弃上游流，连接随之关闭。
//! 请求使用短模型名时，`message_start` 帧里的上游模型ID被改写回短名。

use crate::logging::{LogComponent, LogStage};
use crate::provider::ModelRegistry;
use crate::usage::{StreamUsageCollector, TokenUsage};
use crate::{ldebug, lwarn};
use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// 中继结束的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    /// 上游正常结束
    Completed,
    /// 客户端断开
    ClientGone,
    /// 取消令牌触发（例如服务关闭）
    Cancelled,
    /// 读取上游出错
    UpstreamFailed(String),
}

/// 中继结束后的汇总
#[derive(Debug, Clone)]
pub struct RelaySummary {
    /// 结束原因
    pub end: RelayEnd,
    /// SSE 中出现的模型
    pub model: Option<String>,
    /// 累计用量
    pub usage: TokenUsage,
    /// 转发的字节数
    pub bytes: u64,
}

/// 流式中继
#[derive(Debug, Clone, Copy)]
pub struct StreamRelay {
    capacity: usize,
}

impl StreamRelay {
    /// 通道容量至少为 1
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    /// 启动中继，返回响应体；结束时以汇总调用 `on_finish`
    ///
    /// `surface_model` 为真时把 `message_start` 中的模型ID还原为短名。
    pub fn relay<F>(
        &self,
        request_id: String,
        upstream: reqwest::Response,
        cancel: CancellationToken,
        surface_model: bool,
        on_finish: F,
    ) -> Body
    where
        F: FnOnce(RelaySummary) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(self.capacity);

        tokio::spawn(async move {
            let mut stream = upstream.bytes_stream();
            let mut collector = StreamUsageCollector::new();
            let mut rewriter = MessageStartRewriter::new(surface_model);
            let mut bytes: u64 = 0;

            let end = loop {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break RelayEnd::Cancelled,
                    () = tx.closed() => break RelayEnd::ClientGone,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(chunk)) => {
                        collector.feed(&chunk);
                        bytes += chunk.len() as u64;
                        let Some(chunk) = rewriter.push(chunk) else {
                            continue;
                        };
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => break RelayEnd::Cancelled,
                            sent = tx.send(Ok(chunk)) => {
                                if sent.is_err() {
                                    break RelayEnd::ClientGone;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let message = e.to_string();
                        let _ = tx.send(Err(std::io::Error::other(e))).await;
                        break RelayEnd::UpstreamFailed(message);
                    }
                    None => {
                        if let Some(rest) = rewriter.finish()
                            && tx.send(Ok(rest)).await.is_err()
                        {
                            break RelayEnd::ClientGone;
                        }
                        break RelayEnd::Completed;
                    }
                }
            };
            drop(stream);

            match &end {
                RelayEnd::Completed => ldebug!(
                    request_id,
                    LogStage::ResponseStream,
                    LogComponent::StreamRelay,
                    "stream_completed",
                    "流式响应完成",
                    bytes = bytes
                ),
                other => lwarn!(
                    request_id,
                    LogStage::ResponseStream,
                    LogComponent::StreamRelay,
                    "stream_interrupted",
                    "流式响应提前结束，已关闭上游连接",
                    reason = ?other,
                    bytes = bytes
                ),
            }

            let (model, usage) = collector.finish();
            on_finish(RelaySummary {
                end,
                model,
                usage,
                bytes,
            });
        });

        Body::from_stream(ReceiverStream::new(rx))
    }
}

/// 等待首个事件时的缓冲上限，超过后原样放行
const MESSAGE_START_BUFFER_LIMIT: usize = 64 * 1024;

/// 改写 `message_start` 帧的模型ID；首个非 ping 事件之后直接放行
#[derive(Debug)]
struct MessageStartRewriter {
    pending: BytesMut,
    done: bool,
}

enum FrameKind {
    MessageStart(String),
    Keepalive,
    Other,
}

impl MessageStartRewriter {
    fn new(enabled: bool) -> Self {
        Self {
            pending: BytesMut::new(),
            done: !enabled,
        }
    }

    /// 输入一块上游数据，返回可以立即下发的字节
    fn push(&mut self, chunk: Bytes) -> Option<Bytes> {
        if self.done {
            return Some(chunk);
        }
        self.pending.extend_from_slice(&chunk);

        let mut out = BytesMut::new();
        while !self.done {
            let Some(end) = frame_end(&self.pending) else {
                if self.pending.len() > MESSAGE_START_BUFFER_LIMIT {
                    self.done = true;
                }
                break;
            };
            let frame = self.pending.split_to(end);
            match inspect_frame(&frame) {
                FrameKind::MessageStart(rewritten) => {
                    out.extend_from_slice(rewritten.as_bytes());
                    self.done = true;
                }
                FrameKind::Keepalive => out.extend_from_slice(&frame),
                FrameKind::Other => {
                    out.extend_from_slice(&frame);
                    self.done = true;
                }
            }
        }
        if self.done {
            out.extend_from_slice(&self.pending.split());
        }
        (!out.is_empty()).then(|| out.freeze())
    }

    /// 上游结束，交出缓冲中的剩余字节
    fn finish(&mut self) -> Option<Bytes> {
        self.done = true;
        let rest = self.pending.split();
        (!rest.is_empty()).then(|| rest.freeze())
    }
}

/// 第一个完整 SSE 帧（含结尾空行）的长度
fn frame_end(buf: &[u8]) -> Option<usize> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn inspect_frame(frame: &[u8]) -> FrameKind {
    let Ok(text) = std::str::from_utf8(frame) else {
        return FrameKind::Other;
    };
    let mut out = String::with_capacity(text.len() + 16);
    let mut rewritten = false;
    for line in text.split_inclusive('\n') {
        let content = line.trim_end_matches(['\r', '\n']);
        let Some(payload) = content.strip_prefix("data:") else {
            out.push_str(line);
            continue;
        };
        let Ok(mut value) = serde_json::from_str::<Value>(payload.trim()) else {
            return FrameKind::Other;
        };
        match value.get("type").and_then(Value::as_str) {
            Some("ping") => out.push_str(line),
            Some("message_start") => {
                let Some(model) = value.pointer("/message/model").and_then(Value::as_str) else {
                    return FrameKind::Other;
                };
                let surfaced = ModelRegistry::global().denormalize(model).to_string();
                value["message"]["model"] = Value::String(surfaced);
                out.push_str("data: ");
                out.push_str(&value.to_string());
                out.push_str(&line[content.len()..]);
                rewritten = true;
            }
            _ => return FrameKind::Other,
        }
    }
    if rewritten {
        FrameKind::MessageStart(out)
    } else {
        FrameKind::Keepalive
    }
}
