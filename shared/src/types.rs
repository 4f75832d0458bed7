use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;

// 消息方向
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    // 设备 -> 应用
    Uplink,
    // 应用 -> 设备
    Downlink,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Uplink => "uplink",
            Direction::Downlink => "downlink",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 设备会话中的一条消息 (`devices/{mac}/messages/{id}`)
///
/// 创建后不可修改，`timestamp` 由存储层在写入时分配。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
}

// 待写入的消息，id 和时间戳由存储层分配
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMessage {
    pub text: String,
    pub direction: Direction,
}

impl NewMessage {
    pub fn uplink(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            direction: Direction::Uplink,
        }
    }

    pub fn downlink(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            direction: Direction::Downlink,
        }
    }
}

// 设备文档，id 即 MAC 地址
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub owner_uid: Option<String>,
}

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_uid: None,
        }
    }

    pub fn owned_by(id: impl Into<String>, owner_uid: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_uid: Some(owner_uid.into()),
        }
    }
}

// 订阅计划，序列化为原始字符串
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SubscriptionPlan {
    Free,
    Monthly,
    Annual,
    Other(String),
}

impl SubscriptionPlan {
    pub fn as_str(&self) -> &str {
        match self {
            SubscriptionPlan::Free => "free",
            SubscriptionPlan::Monthly => "monthly",
            SubscriptionPlan::Annual => "annual",
            SubscriptionPlan::Other(plan) => plan,
        }
    }

    /// 只有付费计划 (monthly / annual) 允许设备间 P2P
    pub fn allows_p2p(&self) -> bool {
        matches!(self, SubscriptionPlan::Monthly | SubscriptionPlan::Annual)
    }
}

impl From<String> for SubscriptionPlan {
    fn from(value: String) -> Self {
        match value.as_str() {
            "free" => SubscriptionPlan::Free,
            "monthly" => SubscriptionPlan::Monthly,
            "annual" => SubscriptionPlan::Annual,
            _ => SubscriptionPlan::Other(value),
        }
    }
}

impl From<&str> for SubscriptionPlan {
    fn from(value: &str) -> Self {
        SubscriptionPlan::from(value.to_string())
    }
}

impl From<SubscriptionPlan> for String {
    fn from(plan: SubscriptionPlan) -> Self {
        match plan {
            SubscriptionPlan::Other(plan) => plan,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// 缺失计划视为免费
pub fn allow_p2p_for(plan: Option<&SubscriptionPlan>) -> bool {
    plan.map(SubscriptionPlan::allows_p2p).unwrap_or(false)
}

// 用户文档 (`users/{uid}`)，由外部计费系统修改
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    #[serde(rename = "subscriptionPlan", default, skip_serializing_if = "Option::is_none")]
    pub subscription_plan: Option<SubscriptionPlan>,
}

impl User {
    pub fn new(id: impl Into<String>, subscription_plan: Option<SubscriptionPlan>) -> Self {
        Self {
            id: id.into(),
            subscription_plan,
        }
    }
}

// 文档变更事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DocumentChange {
    // 任意方向的新消息
    MessageCreated {
        device_id: String,
        message: Message,
    },

    // 已存在用户文档被更新
    UserUpdated {
        user_id: String,
        before: User,
        after: User,
    },
}

// API 请求/响应类型
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: "Success".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message,
            timestamp: Utc::now(),
        }
    }
}
