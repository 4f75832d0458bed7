// 文档存储抽象
// 设备会话、用户文档以及变更通知

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use lora_shared::{Device, DocumentChange, Message, NewMessage, StoreError, User};
use tokio::sync::broadcast;

pub use memory::InMemoryDocumentStore;
pub use redis_store::RedisDocumentStore;

/// 设备与用户文档的存储接口
///
/// 每个实现都需要通过 [`DocumentStore::subscribe`] 推送变更事件，
/// 触发器依赖它驱动下行中继和计划变更广播。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 追加一条消息到 `devices/{device_id}/messages`
    ///
    /// 设备不存在时自动创建。返回写入后的消息（含 id 和服务端时间戳）。
    async fn append_message(&self, device_id: &str, message: NewMessage) -> Result<Message, StoreError>;

    // 创建或替换设备文档，保留已有消息
    async fn upsert_device(&self, device: Device) -> Result<(), StoreError>;

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>, StoreError>;

    // 按写入顺序返回消息，设备不存在时为空
    async fn list_messages(&self, device_id: &str) -> Result<Vec<Message>, StoreError>;

    // owner_uid == user_id 的全部设备，按 id 排序
    async fn devices_owned_by(&self, user_id: &str) -> Result<Vec<Device>, StoreError>;

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    /// 创建或替换用户文档
    ///
    /// 只有替换已存在的文档时才产生 `UserUpdated` 事件。
    async fn put_user(&self, user: User) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange>;

    fn backend_name(&self) -> &'static str;
}
