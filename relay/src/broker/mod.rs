// Broker 抽象
// 下行信封发布，以及 MQTT / 内存两种实现

pub mod memory;
pub mod mqtt_client;

use async_trait::async_trait;
use lora_shared::{OutboundEnvelope, PublishError};

pub use memory::InMemoryBroker;
pub use mqtt_client::{RelayMqttClient, UplinkSubscription};

/// 向主题发布 JSON 信封
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnvelopePublisher: Send + Sync {
    async fn publish(&self, topic: &str, envelope: &OutboundEnvelope) -> Result<(), PublishError>;

    // 健康检查用
    async fn is_connected(&self) -> bool;

    fn backend_name(&self) -> &'static str;
}
