//! # SSE 解码
//!
//! 按行解析 `text/event-stream`，空行结束一个事件。`data` 多行拼接后尝试解析为 JSON。

use bytes::BytesMut;
use serde_json::Value;
use std::io;
use tokio_util::codec::Decoder;

/// 一个完整的 SSE 事件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventStream {
    /// `event:` 字段
    pub event: Option<String>,
    /// `id:` 字段
    pub id: Option<String>,
    /// 解析后的 `data:`，无法解析或为 `[DONE]` 时为 `Null`
    pub data: Value,
    /// `retry:` 毫秒数
    pub retry: Option<u64>,
}

impl EventStream {
    /// 事件类型，优先取 `event:`，否则取 data 中的 `type`
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.event
            .as_deref()
            .or_else(|| self.data.get("type").and_then(Value::as_str))
    }
}

/// 增量 SSE 解码器
#[derive(Debug, Clone, Default)]
pub struct EventStreamData {
    current: EventStream,
    has_any: bool,
    data: String,
}

impl EventStreamData {
    /// 创建解码器
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn finish_event(&mut self) -> Option<EventStream> {
        if !self.has_any {
            return None;
        }
        let payload = self.data.trim();
        self.current.data = if payload.is_empty() || payload == "[DONE]" {
            Value::Null
        } else {
            serde_json::from_str(payload).unwrap_or(Value::Null)
        };
        self.has_any = false;
        self.data.clear();
        Some(std::mem::take(&mut self.current))
    }

    fn process_line(&mut self, line: &str) -> Option<EventStream> {
        if line.is_empty() {
            return self.finish_event();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line.split_once(':').map_or((line, ""), |(field, value)| {
            (field, value.strip_prefix(' ').unwrap_or(value))
        });

        match field {
            "data" => {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(value);
            }
            "event" => self.current.event = Some(value.to_string()),
            "id" => self.current.id = Some(value.to_string()),
            "retry" => self.current.retry = value.parse().ok(),
            _ => return None,
        }
        self.has_any = true;
        None
    }

    fn take_line(src: &mut BytesMut) -> io::Result<Option<String>> {
        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let line = src.split_to(pos + 1);
        decode_line(&line).map(Some)
    }
}

fn decode_line(bytes: &[u8]) -> io::Result<String> {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

impl Decoder for EventStreamData {
    type Item = EventStream;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        while let Some(line) = Self::take_line(src)? {
            if let Some(event) = self.process_line(&line) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        if !src.is_empty() {
            let rest = src.split_to(src.len());
            let line = decode_line(&rest)?;
            if let Some(event) = self.process_line(&line) {
                return Ok(Some(event));
            }
        }
        Ok(self.finish_event())
    }
}
