//! # 用量记录器
//!
//! 请求路径只派发记录任务，不等待结果。

use super::types::{ClientUsage, UsageRecord};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// 用量记录接口
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    /// 记录一次转发
    async fn record(&self, record: UsageRecord) -> Result<()>;

    /// 查询客户端累计用量
    async fn client_usage(&self, client_id: &str) -> Result<Option<ClientUsage>>;
}

/// 按客户端聚合的内存记录器
#[derive(Debug, Default)]
pub struct MemoryUsageRecorder {
    clients: DashMap<String, ClientUsage>,
}

impl MemoryUsageRecorder {
    /// 创建记录器
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageRecorder for MemoryUsageRecorder {
    async fn record(&self, record: UsageRecord) -> Result<()> {
        let mut entry = self
            .clients
            .entry(record.client_id.clone())
            .or_insert_with(|| ClientUsage {
                client_id: record.client_id.clone(),
                ..ClientUsage::default()
            });
        entry.apply(&record);
        Ok(())
    }

    async fn client_usage(&self, client_id: &str) -> Result<Option<ClientUsage>> {
        Ok(self.clients.get(client_id).map(|entry| entry.value().clone()))
    }
}

/// 在后台记录用量
pub fn spawn_record(recorder: Arc<dyn UsageRecorder>, record: UsageRecord) {
    tokio::spawn(async move {
        let request_id = record.request_id.clone();
        ldebug!(
            request_id,
            LogStage::Usage,
            LogComponent::Usage,
            "record_usage",
            "记录用量",
            model = %record.model,
            total_tokens = record.usage.total()
        );
        if let Err(e) = recorder.record(record).await {
            lwarn!(
                request_id,
                LogStage::Usage,
                LogComponent::Usage,
                "record_usage_failed",
                "用量记录失败",
                error = %e
            );
        }
    });
}
