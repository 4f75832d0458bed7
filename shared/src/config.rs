use crate::envelope::{DEFAULT_DOWNLINK_TOPIC, DEFAULT_UPLINK_TOPIC};
use ::config::{Config, Environment, File};
use anyhow::Result;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

// 配置相关类型
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub mqtt: MqttConfig,
    pub topics: TopicConfig,
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub relay: RelayOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

// MQTT 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: u64,
    pub clean_session: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: format!("lora-relay-{}", uuid::Uuid::new_v4()),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            max_reconnect_attempts: 10,
            reconnect_interval_ms: 5000,
        }
    }
}

// 主题配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub uplink: String,
    pub downlink: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            uplink: DEFAULT_UPLINK_TOPIC.to_string(),
            downlink: DEFAULT_DOWNLINK_TOPIC.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

// 文档存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    pub change_feed_capacity: usize,
    // 变更事件所在的 Redis Stream
    pub change_stream: String,
    // 同一组内每个事件只投递给一个实例
    pub consumer_group: String,
    // 组内的消费者名；固定名字可在重启后重放未确认的事件
    pub consumer_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            change_feed_capacity: 1024,
            change_stream: "lora:changes".to_string(),
            consumer_group: "lora-relay".to_string(),
            consumer_name: format!("lora-relay-{}", uuid::Uuid::new_v4()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Mqtt,
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
}

// 中继行为选项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayOptions {
    // 网关在 MQTT 上发送的是 base64 文本（与 Pub/Sub 一致）
    pub uplink_payload_base64: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            uplink_payload_base64: true,
        }
    }
}

pub fn load_config() -> Result<AppConfig> {
    // 加载 .env 文件
    dotenv().ok();

    let settings = Config::builder()
        // 添加默认配置文件
        .add_source(File::with_name("config/default").required(false))
        // 添加环境特定配置文件
        .add_source(
            File::with_name(&format!("config/{}", env::var("ENV").unwrap_or_else(|_| "development".to_string())))
                .required(false)
        )
        // 添加环境变量，使用 APP_ 前缀，嵌套字段用 __ 分隔
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
        )
        .build()?;

    // 构建配置
    let config: AppConfig = settings.try_deserialize()?;

    // 验证必要配置
    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.topics.uplink.trim().is_empty() || config.topics.downlink.trim().is_empty() {
        return Err(anyhow::anyhow!("Topic names cannot be empty"));
    }

    if config.topics.uplink == config.topics.downlink {
        return Err(anyhow::anyhow!(
            "Uplink and downlink topics must differ (both are '{}')",
            config.topics.uplink
        ));
    }

    if config.broker.backend == BrokerBackend::Mqtt && config.mqtt.broker_host.is_empty() {
        return Err(anyhow::anyhow!("MQTT broker host cannot be empty"));
    }

    if config.store.backend == StoreBackend::Redis && config.store.redis_url.is_empty() {
        return Err(anyhow::anyhow!("Redis URL cannot be empty"));
    }

    if config.store.backend == StoreBackend::Redis {
        let store = &config.store;
        if store.change_stream.trim().is_empty()
            || store.consumer_group.trim().is_empty()
            || store.consumer_name.trim().is_empty()
        {
            return Err(anyhow::anyhow!(
                "Redis change stream, consumer group and consumer name cannot be empty"
            ));
        }
    }

    if config.store.change_feed_capacity == 0 {
        return Err(anyhow::anyhow!("Change feed capacity must be positive"));
    }

    Ok(())
}
