use futures::future::join_all;
use lora_shared::{allow_p2p_for, OutboundEnvelope, PublishError, StoreError, User};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::broker::EnvelopePublisher;
use crate::store::DocumentStore;

// 单个设备的投递结果
#[derive(Debug)]
pub struct DeviceDelivery {
    pub device_id: String,
    pub result: Result<(), PublishError>,
}

/// 一次广播的逐设备结果，顺序与设备查询结果一致
#[derive(Debug)]
pub struct FanOutReport {
    pub allow_p2p: bool,
    pub deliveries: Vec<DeviceDelivery>,
}

impl FanOutReport {
    pub fn delivered_count(&self) -> usize {
        self.deliveries.iter().filter(|d| d.result.is_ok()).count()
    }

    // 发布失败的设备，可逐个重试
    pub fn failed_devices(&self) -> Vec<&str> {
        self.deliveries
            .iter()
            .filter(|d| d.result.is_err())
            .map(|d| d.device_id.as_str())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.deliveries.iter().all(|d| d.result.is_ok())
    }
}

#[derive(Debug)]
pub enum PlanChangeOutcome {
    // 计划未变化，什么都不做
    Unchanged,
    // 用户名下没有设备
    NoDevices,
    Dispatched(FanOutReport),
}

/// 计划变更广播
///
/// 用户订阅计划变化时，向其名下每个设备发布 `{to_mac, config: {allow_p2p}}`。
/// 所有发布并发进行，只在一个汇合点等待；单个设备失败不影响其他设备。
pub struct PlanChangeFanOut {
    store: Arc<dyn DocumentStore>,
    publisher: Arc<dyn EnvelopePublisher>,
    topic: String,
}

impl PlanChangeFanOut {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        publisher: Arc<dyn EnvelopePublisher>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            store,
            publisher,
            topic: topic.into(),
        }
    }

    pub async fn handle(
        &self,
        user_id: &str,
        before: &User,
        after: &User,
    ) -> Result<PlanChangeOutcome, StoreError> {
        if before.subscription_plan == after.subscription_plan {
            return Ok(PlanChangeOutcome::Unchanged);
        }

        let allow_p2p = allow_p2p_for(after.subscription_plan.as_ref());
        let plan = after
            .subscription_plan
            .as_ref()
            .map(|plan| plan.as_str())
            .unwrap_or("none");

        info!(
            "User {} changed plan to {}, allow_p2p={}",
            user_id, plan, allow_p2p
        );

        let devices = self.store.devices_owned_by(user_id).await?;

        if devices.is_empty() {
            info!("User {} has no devices, nothing to update", user_id);
            return Ok(PlanChangeOutcome::NoDevices);
        }

        let publishes = devices.iter().map(|device| {
            let envelope = OutboundEnvelope::config(device.id.clone(), allow_p2p);
            async move {
                let result = self.publisher.publish(&self.topic, &envelope).await;
                DeviceDelivery {
                    device_id: device.id.clone(),
                    result,
                }
            }
        });

        let report = FanOutReport {
            allow_p2p,
            deliveries: join_all(publishes).await,
        };

        for delivery in &report.deliveries {
            if let Err(e) = &delivery.result {
                error!("Failed to send config to device {}: {}", delivery.device_id, e);
            }
        }

        if report.is_complete() {
            info!(
                "Config update sent to {} devices of user {}",
                report.delivered_count(),
                user_id
            );
        } else {
            warn!(
                "Config update for user {}: {} delivered, {} failed",
                user_id,
                report.delivered_count(),
                report.deliveries.len() - report.delivered_count()
            );
        }

        Ok(PlanChangeOutcome::Dispatched(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, MockEnvelopePublisher};
    use crate::store::{InMemoryDocumentStore, MockDocumentStore};
    use lora_shared::{Device, SubscriptionPlan};

    const TOPIC: &str = "lora-downlink";

    fn user(plan: Option<SubscriptionPlan>) -> User {
        User::new("u1", plan)
    }

    async fn store_with_devices(owner: &str, ids: &[&str]) -> Arc<InMemoryDocumentStore> {
        let store = Arc::new(InMemoryDocumentStore::default());
        for id in ids {
            store.upsert_device(Device::owned_by(*id, owner)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_upgrade_sends_config_to_every_device() {
        let store = store_with_devices("u1", &["AA:BB", "CC:DD"]).await;
        store.upsert_device(Device::owned_by("EE:FF", "u2")).await.unwrap();
        let broker = Arc::new(InMemoryBroker::new());
        let fan_out = PlanChangeFanOut::new(store, broker.clone(), TOPIC);

        let outcome = fan_out
            .handle(
                "u1",
                &user(Some(SubscriptionPlan::Free)),
                &user(Some(SubscriptionPlan::Annual)),
            )
            .await
            .unwrap();

        let report = match outcome {
            PlanChangeOutcome::Dispatched(report) => report,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!(report.allow_p2p);
        assert!(report.is_complete());
        assert_eq!(report.delivered_count(), 2);

        let mut published = broker.published_to(TOPIC).await;
        published.sort_by(|a, b| a.to_mac().cmp(b.to_mac()));
        assert_eq!(
            published,
            vec![
                OutboundEnvelope::config("AA:BB", true),
                OutboundEnvelope::config("CC:DD", true),
            ]
        );
    }

    #[tokio::test]
    async fn test_unchanged_plan_publishes_nothing() {
        let mut store = MockDocumentStore::new();
        store.expect_devices_owned_by().never();
        let mut publisher = MockEnvelopePublisher::new();
        publisher.expect_publish().never();
        let fan_out = PlanChangeFanOut::new(Arc::new(store), Arc::new(publisher), TOPIC);

        let cases = vec![
            (Some(SubscriptionPlan::Monthly), Some(SubscriptionPlan::Monthly)),
            (Some(SubscriptionPlan::from("enterprise")), Some(SubscriptionPlan::from("enterprise"))),
            // 前后都没有计划
            (None, None),
        ];

        for (before, after) in cases {
            let outcome = fan_out.handle("u1", &user(before), &user(after)).await.unwrap();
            assert!(matches!(outcome, PlanChangeOutcome::Unchanged));
        }
    }

    #[tokio::test]
    async fn test_allow_p2p_follows_new_plan() {
        let cases = vec![
            (Some(SubscriptionPlan::Free), Some(SubscriptionPlan::Monthly), true),
            (Some(SubscriptionPlan::Annual), Some(SubscriptionPlan::Free), false),
            (Some(SubscriptionPlan::Monthly), Some(SubscriptionPlan::from("enterprise")), false),
            (Some(SubscriptionPlan::Annual), None, false),
        ];

        for (before, after, expected) in cases {
            let store = store_with_devices("u1", &["AA:BB"]).await;
            let broker = Arc::new(InMemoryBroker::new());
            let fan_out = PlanChangeFanOut::new(store, broker.clone(), TOPIC);

            fan_out.handle("u1", &user(before), &user(after)).await.unwrap();

            assert_eq!(
                broker.published_to(TOPIC).await,
                vec![OutboundEnvelope::config("AA:BB", expected)]
            );
        }
    }

    #[tokio::test]
    async fn test_user_without_devices() {
        let store = Arc::new(InMemoryDocumentStore::default());
        let broker = Arc::new(InMemoryBroker::new());
        let fan_out = PlanChangeFanOut::new(store, broker.clone(), TOPIC);

        let outcome = fan_out
            .handle("u1", &user(None), &user(Some(SubscriptionPlan::Annual)))
            .await
            .unwrap();

        assert!(matches!(outcome, PlanChangeOutcome::NoDevices));
        assert!(broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_one_failed_publish_does_not_mask_others() {
        let store = store_with_devices("u1", &["AA:BB", "CC:DD", "EE:FF"]).await;
        let mut publisher = MockEnvelopePublisher::new();
        publisher.expect_publish().times(3).returning(|_, envelope| {
            if envelope.to_mac() == "CC:DD" {
                Err(PublishError::Broker("queue full".to_string()))
            } else {
                Ok(())
            }
        });
        let fan_out = PlanChangeFanOut::new(store, Arc::new(publisher), TOPIC);

        let outcome = fan_out
            .handle(
                "u1",
                &user(Some(SubscriptionPlan::Free)),
                &user(Some(SubscriptionPlan::Monthly)),
            )
            .await
            .unwrap();

        let report = match outcome {
            PlanChangeOutcome::Dispatched(report) => report,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!(!report.is_complete());
        assert_eq!(report.delivered_count(), 2);
        assert_eq!(report.failed_devices(), vec!["CC:DD"]);
        let ids: Vec<&str> = report.deliveries.iter().map(|d| d.device_id.as_str()).collect();
        assert_eq!(ids, vec!["AA:BB", "CC:DD", "EE:FF"]);
    }

    #[tokio::test]
    async fn test_device_query_error_is_returned() {
        let mut store = MockDocumentStore::new();
        store
            .expect_devices_owned_by()
            .returning(|_| Err(StoreError::Backend("timeout".to_string())));
        let mut publisher = MockEnvelopePublisher::new();
        publisher.expect_publish().never();
        let fan_out = PlanChangeFanOut::new(Arc::new(store), Arc::new(publisher), TOPIC);

        let result = fan_out
            .handle("u1", &user(None), &user(Some(SubscriptionPlan::Annual)))
            .await;

        assert!(matches!(result, Err(StoreError::Backend(_))));
    }
}
