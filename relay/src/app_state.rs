use chrono::{DateTime, Utc};
use lora_shared::AppConfig;
use std::sync::Arc;

use crate::broker::EnvelopePublisher;
use crate::handlers::UplinkRelay;
use crate::store::DocumentStore;

/// HTTP 层共享状态
///
/// 所有客户端在启动时创建一次，通过 `Arc` 显式传递。
#[derive(Clone)]
pub struct AppState {
    /// 文档存储
    pub store: Arc<dyn DocumentStore>,
    /// 下行发布
    pub publisher: Arc<dyn EnvelopePublisher>,
    /// Pub/Sub push 入口使用的上行中继
    pub uplink: Arc<UplinkRelay>,
    /// 服务配置
    pub config: Arc<AppConfig>,
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        publisher: Arc<dyn EnvelopePublisher>,
        uplink: Arc<UplinkRelay>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            uplink,
            config: Arc::new(config),
            start_time: Utc::now(),
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }
}
