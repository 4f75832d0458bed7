use async_trait::async_trait;
use lora_shared::utils::{generate_message_id, next_timestamp, now_utc};
use lora_shared::{Device, DocumentChange, Message, NewMessage, StoreError, User};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::DocumentStore;

// 设备文档及其消息子集合
#[derive(Debug, Clone)]
struct DeviceRecord {
    device: Device,
    messages: Vec<Message>,
}

/// 进程内文档存储
///
/// 用于本地开发和测试，重启后数据丢失。
pub struct InMemoryDocumentStore {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    users: RwLock<HashMap<String, User>>,
    changes: broadcast::Sender<DocumentChange>,
}

impl InMemoryDocumentStore {
    pub fn new(change_feed_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_feed_capacity.max(1));

        Self {
            devices: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            changes,
        }
    }

    // 没有订阅者时发送失败是正常情况
    fn emit(&self, change: DocumentChange) {
        if self.changes.send(change).is_err() {
            debug!("No change feed subscribers, event dropped");
        }
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn append_message(&self, device_id: &str, message: NewMessage) -> Result<Message, StoreError> {
        if device_id.is_empty() {
            return Err(StoreError::InvalidDocument("device id cannot be empty".to_string()));
        }

        let stored = {
            let mut devices = self.devices.write().await;
            let record = devices
                .entry(device_id.to_string())
                .or_insert_with(|| DeviceRecord {
                    device: Device::new(device_id),
                    messages: Vec::new(),
                });

            let previous = record.messages.last().map(|m| m.timestamp);
            let stored = Message {
                id: generate_message_id(),
                text: message.text,
                timestamp: next_timestamp(previous, now_utc()),
                direction: message.direction,
            };

            record.messages.push(stored.clone());
            stored
        };

        self.emit(DocumentChange::MessageCreated {
            device_id: device_id.to_string(),
            message: stored.clone(),
        });

        Ok(stored)
    }

    async fn upsert_device(&self, device: Device) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;

        match devices.get_mut(&device.id) {
            Some(record) => record.device = device,
            None => {
                devices.insert(
                    device.id.clone(),
                    DeviceRecord {
                        device,
                        messages: Vec::new(),
                    },
                );
            }
        }

        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        let devices = self.devices.read().await;
        Ok(devices.get(device_id).map(|record| record.device.clone()))
    }

    async fn list_messages(&self, device_id: &str) -> Result<Vec<Message>, StoreError> {
        let devices = self.devices.read().await;
        Ok(devices
            .get(device_id)
            .map(|record| record.messages.clone())
            .unwrap_or_default())
    }

    async fn devices_owned_by(&self, user_id: &str) -> Result<Vec<Device>, StoreError> {
        let devices = self.devices.read().await;

        let mut owned: Vec<Device> = devices
            .values()
            .filter(|record| record.device.owner_uid.as_deref() == Some(user_id))
            .map(|record| record.device.clone())
            .collect();
        owned.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(owned)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn put_user(&self, user: User) -> Result<(), StoreError> {
        if user.id.is_empty() {
            return Err(StoreError::InvalidDocument("user id cannot be empty".to_string()));
        }

        let before = {
            let mut users = self.users.write().await;
            users.insert(user.id.clone(), user.clone())
        };

        if let Some(before) = before {
            self.emit(DocumentChange::UserUpdated {
                user_id: user.id.clone(),
                before,
                after: user,
            });
        }

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.changes.subscribe()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lora_shared::{Direction, SubscriptionPlan};

    #[tokio::test]
    async fn test_append_creates_device_implicitly() {
        let store = InMemoryDocumentStore::default();
        assert!(store.get_device("AA:BB").await.unwrap().is_none());

        let message = store.append_message("AA:BB", NewMessage::uplink("hello")).await.unwrap();

        assert_eq!(message.text, "hello");
        assert_eq!(message.direction, Direction::Uplink);
        assert_eq!(store.get_device("AA:BB").await.unwrap(), Some(Device::new("AA:BB")));
        assert_eq!(store.list_messages("AA:BB").await.unwrap(), vec![message]);
    }

    #[tokio::test]
    async fn test_messages_keep_insertion_order_and_increasing_timestamps() {
        let store = InMemoryDocumentStore::default();

        for i in 0..50 {
            store
                .append_message("AA:BB", NewMessage::uplink(format!("reading {}", i)))
                .await
                .unwrap();
        }

        let messages = store.list_messages("AA:BB").await.unwrap();
        assert_eq!(messages.len(), 50);
        assert_eq!(messages[0].text, "reading 0");
        assert_eq!(messages[49].text, "reading 49");
        assert!(messages.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
    }

    #[tokio::test]
    async fn test_upsert_device_keeps_thread() {
        let store = InMemoryDocumentStore::default();
        store.append_message("AA:BB", NewMessage::uplink("first")).await.unwrap();

        store.upsert_device(Device::owned_by("AA:BB", "u1")).await.unwrap();

        assert_eq!(store.list_messages("AA:BB").await.unwrap().len(), 1);
        assert_eq!(
            store.get_device("AA:BB").await.unwrap().unwrap().owner_uid.as_deref(),
            Some("u1")
        );
    }

    #[tokio::test]
    async fn test_devices_owned_by_filters_on_owner() {
        let store = InMemoryDocumentStore::default();
        store.upsert_device(Device::owned_by("CC:DD", "u1")).await.unwrap();
        store.upsert_device(Device::owned_by("AA:BB", "u1")).await.unwrap();
        store.upsert_device(Device::owned_by("EE:FF", "u2")).await.unwrap();
        store.upsert_device(Device::new("11:22")).await.unwrap();

        let ids: Vec<String> = store
            .devices_owned_by("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|device| device.id)
            .collect();

        assert_eq!(ids, vec!["AA:BB".to_string(), "CC:DD".to_string()]);
        assert!(store.devices_owned_by("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_change_feed_reports_messages_and_user_updates() {
        let store = InMemoryDocumentStore::default();
        let mut feed = store.subscribe();

        // 创建用户不产生更新事件
        store.put_user(User::new("u1", Some(SubscriptionPlan::Free))).await.unwrap();
        let message = store.append_message("AA:BB", NewMessage::downlink("hi")).await.unwrap();
        store.put_user(User::new("u1", Some(SubscriptionPlan::Annual))).await.unwrap();

        assert_eq!(
            feed.recv().await.unwrap(),
            DocumentChange::MessageCreated {
                device_id: "AA:BB".to_string(),
                message,
            }
        );
        assert_eq!(
            feed.recv().await.unwrap(),
            DocumentChange::UserUpdated {
                user_id: "u1".to_string(),
                before: User::new("u1", Some(SubscriptionPlan::Free)),
                after: User::new("u1", Some(SubscriptionPlan::Annual)),
            }
        );
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_ids_are_rejected() {
        let store = InMemoryDocumentStore::default();

        assert!(matches!(
            store.append_message("", NewMessage::uplink("x")).await,
            Err(StoreError::InvalidDocument(_))
        ));
        assert!(store.put_user(User::new("", None)).await.is_err());
    }
}
