// LoRa 设备与聊天文档存储之间的中继服务

pub mod api_handlers;
pub mod app_state;
pub mod broker;
pub mod handlers;
pub mod store;
pub mod triggers;
