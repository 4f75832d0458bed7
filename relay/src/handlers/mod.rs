// 三个中继处理器：上行写入、下行发布、计划变更广播
// 处理器之间不直接调用，只通过文档存储和主题通信

pub mod downlink;
pub mod plan_change;
pub mod uplink;

pub use downlink::DownlinkRelay;
pub use plan_change::{DeviceDelivery, FanOutReport, PlanChangeFanOut, PlanChangeOutcome};
pub use uplink::UplinkRelay;
