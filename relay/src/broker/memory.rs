use async_trait::async_trait;
use lora_shared::{OutboundEnvelope, PublishError};
use tokio::sync::RwLock;
use tracing::debug;

use super::EnvelopePublisher;

// 已发布的信封
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedEnvelope {
    pub topic: String,
    pub envelope: OutboundEnvelope,
}

/// 进程内 broker，只记录发布内容
#[derive(Default)]
pub struct InMemoryBroker {
    published: RwLock<Vec<PublishedEnvelope>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // 获取已发布的信封
    pub async fn published(&self) -> Vec<PublishedEnvelope> {
        self.published.read().await.clone()
    }

    pub async fn published_to(&self, topic: &str) -> Vec<OutboundEnvelope> {
        self.published
            .read()
            .await
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.envelope.clone())
            .collect()
    }
}

#[async_trait]
impl EnvelopePublisher for InMemoryBroker {
    async fn publish(&self, topic: &str, envelope: &OutboundEnvelope) -> Result<(), PublishError> {
        // 与真实 broker 一样先序列化，保证信封可编码
        let payload = envelope.to_json_bytes()?;
        debug!("Recorded {} byte envelope for topic {}", payload.len(), topic);

        self.published.write().await.push(PublishedEnvelope {
            topic: topic.to_string(),
            envelope: envelope.clone(),
        });

        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_envelopes_per_topic() {
        let broker = InMemoryBroker::new();

        broker.publish("lora-downlink", &OutboundEnvelope::downlink("AA:BB", "hi")).await.unwrap();
        broker.publish("other", &OutboundEnvelope::config("AA:BB", true)).await.unwrap();

        assert_eq!(broker.published().await.len(), 2);
        assert_eq!(
            broker.published_to("lora-downlink").await,
            vec![OutboundEnvelope::downlink("AA:BB", "hi")]
        );
    }
}
