use lora_shared::utils::truncate_for_log;
use lora_shared::{BrokerMessage, NewMessage, UplinkEnvelope};
use std::sync::Arc;
use tracing::{error, info};

use crate::store::DocumentStore;

// 日志中负载的最大长度
const LOG_PAYLOAD_CHARS: usize = 256;

/// 上行中继：设备 -> 应用
///
/// 把网关发来的信封写入 `devices/{mac}/messages`，设备文档不存在时自动创建。
/// 任何错误只记录日志，不向上游报告。
pub struct UplinkRelay {
    store: Arc<dyn DocumentStore>,
}

impl UplinkRelay {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn handle(&self, message: &BrokerMessage) {
        let uplink = match message.decode_uplink().and_then(UplinkEnvelope::validate) {
            Ok(uplink) => uplink,
            Err(e) => {
                error!(
                    "Invalid uplink envelope ({}): {}",
                    e,
                    truncate_for_log(&message.data, LOG_PAYLOAD_CHARS)
                );
                return;
            }
        };

        info!(
            "Received uplink from {}: {}",
            uplink.mac_address,
            truncate_for_log(&uplink.payload, LOG_PAYLOAD_CHARS)
        );

        match self
            .store
            .append_message(&uplink.mac_address, NewMessage::uplink(uplink.payload))
            .await
        {
            Ok(stored) => {
                info!("Stored uplink message {} for device {}", stored.id, uplink.mac_address);
            }
            Err(e) => {
                error!("Failed to store uplink message for {}: {}", uplink.mac_address, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryDocumentStore, MockDocumentStore};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use lora_shared::{Direction, StoreError};

    fn envelope(json: &str) -> BrokerMessage {
        BrokerMessage::new(STANDARD.encode(json))
    }

    #[tokio::test]
    async fn test_uplink_creates_device_and_message() {
        let store = Arc::new(InMemoryDocumentStore::default());
        let relay = UplinkRelay::new(store.clone());

        relay
            .handle(&envelope(r#"{"mac_address":"AA:BB","payload":"hello"}"#))
            .await;

        assert!(store.get_device("AA:BB").await.unwrap().is_some());

        let messages = store.list_messages("AA:BB").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "hello");
        assert_eq!(messages[0].direction, Direction::Uplink);
    }

    #[tokio::test]
    async fn test_uplink_appends_to_existing_thread() {
        let store = Arc::new(InMemoryDocumentStore::default());
        let relay = UplinkRelay::new(store.clone());

        relay
            .handle(&envelope(r#"{"mac_address":"AA:BB","payload":"first"}"#))
            .await;
        relay
            .handle(&envelope(r#"{"mac_address":"AA:BB","payload":"second"}"#))
            .await;

        let texts: Vec<String> = store
            .list_messages("AA:BB")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_envelopes_have_no_side_effects() {
        let mut store = MockDocumentStore::new();
        store.expect_append_message().never();
        let relay = UplinkRelay::new(Arc::new(store));

        // 缺少 mac_address
        relay.handle(&envelope(r#"{"payload":"hello"}"#)).await;
        // 空负载
        relay
            .handle(&envelope(r#"{"mac_address":"AA:BB","payload":""}"#))
            .await;
        // 不是 JSON
        relay.handle(&envelope("mac=AA:BB")).await;
        // 不是 base64
        relay.handle(&BrokerMessage::new("%%%")).await;
    }

    #[tokio::test]
    async fn test_store_errors_are_swallowed() {
        let mut store = MockDocumentStore::new();
        store
            .expect_append_message()
            .times(1)
            .returning(|_, _| Err(StoreError::Backend("connection refused".to_string())));
        let relay = UplinkRelay::new(Arc::new(store));

        relay
            .handle(&envelope(r#"{"mac_address":"AA:BB","payload":"hello"}"#))
            .await;
    }
}
