use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// 默认主题，与网关侧 MQTT 主题一一对应
pub const DEFAULT_UPLINK_TOPIC: &str = "lora-uplink";
pub const DEFAULT_DOWNLINK_TOPIC: &str = "lora-downlink";

// 信封解析错误
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Invalid base64 data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Broker 投递单元，结构与 Pub/Sub push 消息一致
///
/// `data` 为 base64 编码的 JSON。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerMessage {
    pub data: String,
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

impl BrokerMessage {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            message_id: None,
            attributes: HashMap::new(),
        }
    }

    // 将原始 JSON 包装为 base64
    pub fn from_json_bytes(bytes: &[u8]) -> Self {
        Self::new(STANDARD.encode(bytes))
    }

    // 解码为上行信封（尚未校验字段）
    pub fn decode_uplink(&self) -> Result<UplinkEnvelope, EnvelopeError> {
        let bytes = STANDARD.decode(self.data.trim())?;
        let envelope = serde_json::from_slice(&bytes)?;
        Ok(envelope)
    }
}

// Pub/Sub push 请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub message: BrokerMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

// 网关发出的上行信封
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UplinkEnvelope {
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
}

// 校验后的上行数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidUplink {
    pub mac_address: String,
    pub payload: String,
}

impl UplinkEnvelope {
    // 缺失或空字符串均视为无效
    pub fn validate(self) -> Result<ValidUplink, EnvelopeError> {
        let mac_address = self
            .mac_address
            .filter(|mac| !mac.is_empty())
            .ok_or(EnvelopeError::MissingField("mac_address"))?;
        let payload = self
            .payload
            .filter(|payload| !payload.is_empty())
            .ok_or(EnvelopeError::MissingField("payload"))?;

        Ok(ValidUplink {
            mac_address,
            payload,
        })
    }
}

// 下行文本信封
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownlinkEnvelope {
    pub to_mac: String,
    pub payload: String,
}

// 设备配置
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    pub allow_p2p: bool,
}

// 下行配置信封
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigEnvelope {
    pub to_mac: String,
    pub config: DeviceConfig,
}

/// 发布到下行主题的信封
///
/// untagged 序列化，线上格式即为两种结构本身。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OutboundEnvelope {
    Config(ConfigEnvelope),
    Downlink(DownlinkEnvelope),
}

impl OutboundEnvelope {
    pub fn downlink(to_mac: impl Into<String>, payload: impl Into<String>) -> Self {
        OutboundEnvelope::Downlink(DownlinkEnvelope {
            to_mac: to_mac.into(),
            payload: payload.into(),
        })
    }

    pub fn config(to_mac: impl Into<String>, allow_p2p: bool) -> Self {
        OutboundEnvelope::Config(ConfigEnvelope {
            to_mac: to_mac.into(),
            config: DeviceConfig { allow_p2p },
        })
    }

    pub fn to_mac(&self) -> &str {
        match self {
            OutboundEnvelope::Config(envelope) => &envelope.to_mac,
            OutboundEnvelope::Downlink(envelope) => &envelope.to_mac,
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
