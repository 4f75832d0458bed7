// 事件触发器：把上行消息和文档变更转换为独立的处理器调用
// 每个事件一个任务，任务之间不保证顺序

use lora_shared::{BrokerMessage, DocumentChange};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handlers::{DownlinkRelay, PlanChangeFanOut, UplinkRelay};

/// 上行触发器：每条 broker 消息调用一次上行中继
pub fn spawn_uplink_trigger(
    mut rx: mpsc::UnboundedReceiver<BrokerMessage>,
    relay: Arc<UplinkRelay>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Uplink trigger started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => {
                        let relay = relay.clone();
                        tokio::spawn(async move {
                            relay.handle(&message).await;
                        });
                    }
                    None => {
                        debug!("Uplink channel closed");
                        break;
                    }
                }
            }
        }

        info!("Uplink trigger stopped");
    })
}

/// 变更触发器
///
/// `MessageCreated` 交给下行中继，`UserUpdated` 交给计划变更广播。
/// 订阅滞后时丢弃的事件只记录警告。
pub fn spawn_change_trigger(
    mut feed: broadcast::Receiver<DocumentChange>,
    downlink: Arc<DownlinkRelay>,
    fan_out: Arc<PlanChangeFanOut>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Change trigger started");

        loop {
            let change = tokio::select! {
                _ = shutdown.cancelled() => break,
                change = feed.recv() => change,
            };

            match change {
                Ok(DocumentChange::MessageCreated { device_id, message }) => {
                    let downlink = downlink.clone();
                    tokio::spawn(async move {
                        downlink.handle(&device_id, &message).await;
                    });
                }
                Ok(DocumentChange::UserUpdated { user_id, before, after }) => {
                    let fan_out = fan_out.clone();
                    tokio::spawn(async move {
                        if let Err(e) = fan_out.handle(&user_id, &before, &after).await {
                            error!("Failed to look up devices for user {}: {}", user_id, e);
                        }
                    });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Change trigger lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Change feed closed");
                    break;
                }
            }
        }

        info!("Change trigger stopped");
    })
}
