use lora_shared::utils::truncate_for_log;
use lora_shared::{Direction, Message, OutboundEnvelope};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::broker::EnvelopePublisher;

/// 下行中继：应用 -> 设备
///
/// 每条新建的 downlink 消息发布为 `{to_mac, payload}` 到下行主题。
pub struct DownlinkRelay {
    publisher: Arc<dyn EnvelopePublisher>,
    topic: String,
}

impl DownlinkRelay {
    pub fn new(publisher: Arc<dyn EnvelopePublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }

    pub async fn handle(&self, device_id: &str, message: &Message) {
        if message.direction != Direction::Downlink {
            debug!("Skipping {} message {} for {}", message.direction, message.id, device_id);
            return;
        }

        info!(
            "Sending downlink to {}: {}",
            device_id,
            truncate_for_log(&message.text, 256)
        );

        let envelope = OutboundEnvelope::downlink(device_id, message.text.clone());

        match self.publisher.publish(&self.topic, &envelope).await {
            Ok(()) => info!("Downlink message {} published to {}", message.id, self.topic),
            Err(e) => error!("Failed to publish downlink for {}: {}", device_id, e),
        }
    }
}
