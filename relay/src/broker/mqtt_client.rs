use anyhow::{Context, Result};
use async_trait::async_trait;
use lora_shared::{BrokerMessage, MqttConfig, OutboundEnvelope, PublishError};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::EnvelopePublisher;

// 上行订阅参数
#[derive(Debug, Clone)]
pub struct UplinkSubscription {
    pub topic: String,
    // true: 负载已是 base64 文本；false: 负载为原始 JSON
    pub payload_base64: bool,
}

// Relay MQTT 客户端
pub struct RelayMqttClient {
    client: AsyncClient,
    config: MqttConfig,
    is_connected: Arc<RwLock<bool>>,
    reconnect_count: Arc<RwLock<u32>>,
}

impl RelayMqttClient {
    pub fn new(config: MqttConfig) -> Result<(Self, EventLoop)> {
        let mut mqtt_options = MqttOptions::new(
            config.client_id.clone(),
            &config.broker_host,
            config.broker_port,
        );

        // 设置认证信息
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        // 设置保持连接
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive));
        mqtt_options.set_clean_session(config.clean_session);

        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);

        let mqtt_client = Self {
            client,
            config,
            is_connected: Arc::new(RwLock::new(false)),
            reconnect_count: Arc::new(RwLock::new(0)),
        };

        Ok((mqtt_client, event_loop))
    }

    /// 启动事件循环任务
    ///
    /// 每次 ConnAck 后重新订阅上行主题，收到的上行消息转发到 `sink`。
    pub fn start(
        &self,
        event_loop: EventLoop,
        uplink: UplinkSubscription,
        sink: mpsc::UnboundedSender<BrokerMessage>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        info!(
            "Starting MQTT client for {}:{}",
            self.config.broker_host, self.config.broker_port
        );

        let client = self.client.clone();
        let config = self.config.clone();
        let is_connected = self.is_connected.clone();
        let reconnect_count = self.reconnect_count.clone();

        tokio::spawn(async move {
            Self::run_event_loop(
                client,
                event_loop,
                config,
                uplink,
                sink,
                is_connected,
                reconnect_count,
                shutdown,
            )
            .await;
        })
    }

    // 运行事件循环
    #[allow(clippy::too_many_arguments)]
    async fn run_event_loop(
        client: AsyncClient,
        mut event_loop: EventLoop,
        config: MqttConfig,
        uplink: UplinkSubscription,
        sink: mpsc::UnboundedSender<BrokerMessage>,
        is_connected: Arc<RwLock<bool>>,
        reconnect_count: Arc<RwLock<u32>>,
        shutdown: CancellationToken,
    ) {
        info!("Starting MQTT event loop");
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("MQTT shutdown signal received");
                    if let Err(e) = client.disconnect().await {
                        debug!("MQTT disconnect request failed: {}", e);
                    }
                    break;
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(connack))) => {
                        info!("MQTT connection established: {:?}", connack.code);
                        *is_connected.write().await = true;
                        consecutive_failures = 0;

                        if let Err(e) = Self::subscribe_uplink(&client, &uplink.topic) {
                            error!("Failed to subscribe to uplink topic: {}", e);
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if publish.topic != uplink.topic {
                            debug!("Ignoring MQTT message on topic: {}", publish.topic);
                            continue;
                        }

                        debug!("Received uplink on {} ({} bytes)", publish.topic, publish.payload.len());

                        match Self::parse_incoming_message(&publish.payload, uplink.payload_base64) {
                            Ok(message) => {
                                if let Err(e) = sink.send(message) {
                                    error!("Failed to forward uplink message: {}", e);
                                }
                            }
                            Err(e) => {
                                error!("Failed to parse MQTT message: {}", e);
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::SubAck(suback))) => {
                        debug!("Subscription acknowledged: {:?}", suback.return_codes);
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        warn!("MQTT broker initiated disconnect");
                        *is_connected.write().await = false;
                    }
                    Ok(Event::Incoming(Incoming::PingResp)) => {}
                    Ok(Event::Incoming(incoming)) => {
                        debug!("Received other MQTT packet: {:?}", incoming);
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        debug!("Message published to MQTT broker (pkid {})", pkid);
                    }
                    Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        *is_connected.write().await = false;

                        consecutive_failures += 1;
                        *reconnect_count.write().await += 1;

                        if consecutive_failures > config.max_reconnect_attempts {
                            // 之后 is_connected 一直为 false，/health 返回 503
                            error!("Max MQTT reconnect attempts reached, giving up");
                            break;
                        }

                        warn!(
                            "Attempting to reconnect to MQTT broker (attempt {}/{}), retrying in {}ms",
                            consecutive_failures,
                            config.max_reconnect_attempts,
                            config.reconnect_interval_ms
                        );

                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_millis(config.reconnect_interval_ms)) => {}
                        }
                    }
                }
            }
        }

        *is_connected.write().await = false;
        info!("MQTT event loop stopped");
    }

    // 订阅上行主题；事件循环内不能等待请求队列，使用 try_subscribe
    fn subscribe_uplink(client: &AsyncClient, topic: &str) -> Result<()> {
        client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .with_context(|| format!("Failed to subscribe to topic: {}", topic))?;

        info!("Subscribed to MQTT topic: {}", topic);
        Ok(())
    }

    // 解析接收到的消息
    pub fn parse_incoming_message(payload: &[u8], payload_base64: bool) -> Result<BrokerMessage> {
        if !payload_base64 {
            return Ok(BrokerMessage::from_json_bytes(payload));
        }

        let data = std::str::from_utf8(payload)
            .with_context(|| "Uplink payload is not valid UTF-8 base64 text")?;

        Ok(BrokerMessage::new(data.trim()))
    }

    // 获取重连次数
    pub async fn get_reconnect_count(&self) -> u32 {
        *self.reconnect_count.read().await
    }
}

#[async_trait]
impl EnvelopePublisher for RelayMqttClient {
    // 请求进入客户端队列即视为成功，不等待 PUBACK
    async fn publish(&self, topic: &str, envelope: &OutboundEnvelope) -> Result<(), PublishError> {
        let payload = envelope.to_json_bytes()?;

        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| PublishError::Broker(format!("Failed to publish to {}: {}", topic, e)))?;

        debug!("Published envelope for {} to topic: {}", envelope.to_mac(), topic);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        *self.is_connected.read().await
    }

    fn backend_name(&self) -> &'static str {
        "mqtt"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine};

    #[test]
    fn test_parse_base64_payload() {
        let raw = r#"{"mac_address":"AA:BB","payload":"hello"}"#;
        let encoded = format!("{}\n", STANDARD.encode(raw));

        let message = RelayMqttClient::parse_incoming_message(encoded.as_bytes(), true).unwrap();
        let uplink = message.decode_uplink().unwrap();

        assert_eq!(uplink.mac_address.as_deref(), Some("AA:BB"));
        assert_eq!(uplink.payload.as_deref(), Some("hello"));
    }

    #[test]
    fn test_parse_raw_json_payload() {
        let raw = br#"{"mac_address":"CC:DD","payload":"t=21"}"#;

        let message = RelayMqttClient::parse_incoming_message(raw, false).unwrap();
        assert_eq!(message.decode_uplink().unwrap().payload.as_deref(), Some("t=21"));
    }

    #[test]
    fn test_parse_rejects_binary_when_base64_expected() {
        assert!(RelayMqttClient::parse_incoming_message(&[0xff, 0xfe, 0x00], true).is_err());
    }

    #[tokio::test]
    async fn test_event_loop_gives_up_and_stays_disconnected() {
        // 端口 1 无服务，连接立即被拒绝
        let config = MqttConfig {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1,
            client_id: "lora-relay-test".to_string(),
            max_reconnect_attempts: 0,
            reconnect_interval_ms: 10,
            ..MqttConfig::default()
        };
        let (client, event_loop) = RelayMqttClient::new(config).unwrap();
        let (sink, _rx) = mpsc::unbounded_channel();
        let uplink = UplinkSubscription {
            topic: "lora-uplink".to_string(),
            payload_base64: true,
        };

        let handle = client.start(event_loop, uplink, sink, CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(!client.is_connected().await);
        assert_eq!(client.get_reconnect_count().await, 1);
        assert!(client
            .publish("lora-downlink", &OutboundEnvelope::downlink("AA:BB", "ping"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_new_client_starts_disconnected() {
        let config = MqttConfig {
            client_id: "lora-relay-test".to_string(),
            ..MqttConfig::default()
        };

        let (client, _event_loop) = RelayMqttClient::new(config).unwrap();

        assert!(!client.is_connected().await);
        assert_eq!(client.get_reconnect_count().await, 0);
        assert_eq!(client.backend_name(), "mqtt");
    }
}
