//! # 用量提取
//!
//! 非流式响应直接读取 `usage`；流式响应从 `message_start` 与 `message_delta` 事件累计。

use super::types::TokenUsage;
use crate::utils::EventStreamData;
use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::Decoder;

/// 从完整 JSON 响应体中提取模型与用量
#[must_use]
pub fn usage_from_json(body: &[u8]) -> Option<(Option<String>, TokenUsage)> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let usage_value = value.get("usage")?;
    let mut usage = TokenUsage::default();
    usage.merge_from(usage_value);
    let model = value
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some((model, usage))
}

/// 流式响应的用量累计器
#[derive(Debug, Default)]
pub struct StreamUsageCollector {
    decoder: EventStreamData,
    buffer: BytesMut,
    usage: TokenUsage,
    model: Option<String>,
    completed: bool,
}

impl StreamUsageCollector {
    /// 创建累计器
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 输入一段原始字节
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Ok(Some(event)) = self.decoder.decode(&mut self.buffer) {
            self.observe(event.kind().map(str::to_string).as_deref(), &event.data);
        }
    }

    fn observe(&mut self, kind: Option<&str>, data: &Value) {
        match kind {
            Some("message_start") => {
                if let Some(message) = data.get("message") {
                    if let Some(usage) = message.get("usage") {
                        self.usage.merge_from(usage);
                    }
                    if let Some(model) = message.get("model").and_then(Value::as_str) {
                        self.model = Some(model.to_string());
                    }
                }
            }
            Some("message_delta") => {
                if let Some(usage) = data.get("usage") {
                    self.usage.merge_from(usage);
                }
            }
            Some("message_stop") => self.completed = true,
            _ => {}
        }
    }

    /// 是否收到了 `message_stop`
    #[must_use]
    pub const fn completed(&self) -> bool {
        self.completed
    }

    /// 结束累计，处理残留数据
    #[must_use]
    pub fn finish(mut self) -> (Option<String>, TokenUsage) {
        while let Ok(Some(event)) = self.decoder.decode_eof(&mut self.buffer) {
            self.observe(event.kind().map(str::to_string).as_deref(), &event.data);
        }
        (self.model, self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_usage_from_json() {
        let body = br#"{"id":"msg_1","model":"claude-sonnet-4-5-20250929","usage":{"input_tokens":10,"output_tokens":3,"cache_read_input_tokens":2}}"#;
        let (model, usage) = usage_from_json(body).unwrap();
        assert_eq!(model.as_deref(), Some("claude-sonnet-4-5-20250929"));
        assert_eq!(
            usage,
            TokenUsage {
                input_tokens: 10,
                output_tokens: 3,
                cache_creation_input_tokens: 0,
                cache_read_input_tokens: 2,
            }
        );
        assert!(usage_from_json(b"not json").is_none());
    }

    #[test]
    fn test_stream_usage_across_chunk_boundaries() {
        let stream = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-haiku-4-5-20251001\",\"usage\":{\"input_tokens\":25,\"output_tokens\":1,\"cache_creation_input_tokens\":7}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":42}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let mut collector = StreamUsageCollector::new();
        for chunk in stream.as_bytes().chunks(17) {
            collector.feed(chunk);
        }
        assert!(collector.completed());

        let (model, usage) = collector.finish();
        assert_eq!(model.as_deref(), Some("claude-haiku-4-5-20251001"));
        assert_eq!(usage.input_tokens, 25);
        assert_eq!(usage.output_tokens, 42);
        assert_eq!(usage.cache_creation_input_tokens, 7);
    }
}
