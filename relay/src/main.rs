use anyhow::{Context, Result};
use lora_shared::{load_config, BrokerBackend, StoreBackend};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lora_relay::api_handlers;
use lora_relay::app_state::AppState;
use lora_relay::broker::{EnvelopePublisher, InMemoryBroker, RelayMqttClient, UplinkSubscription};
use lora_relay::handlers::{DownlinkRelay, PlanChangeFanOut, UplinkRelay};
use lora_relay::store::{DocumentStore, InMemoryDocumentStore, RedisDocumentStore};
use lora_relay::triggers;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting LoRa Relay Service...");

    // 加载配置
    let config = load_config().context("Failed to load configuration")?;
    info!(
        "Relay configuration: store={:?}, broker={:?}, uplink topic={}, downlink topic={}",
        config.store.backend, config.broker.backend, config.topics.uplink, config.topics.downlink
    );

    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    // 文档存储
    let capacity = config.store.change_feed_capacity;
    let store: Arc<dyn DocumentStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory document store, data is lost on restart");
            Arc::new(InMemoryDocumentStore::new(capacity))
        }
        StoreBackend::Redis => Arc::new(
            RedisDocumentStore::connect(&config.store, shutdown.clone())
                .await
                .context("Failed to connect to Redis document store")?,
        ),
    };

    // 上行消息通道 (MQTT -> 上行触发器)
    let (uplink_tx, uplink_rx) = mpsc::unbounded_channel();

    // Broker
    let publisher: Arc<dyn EnvelopePublisher> = match config.broker.backend {
        BrokerBackend::Mqtt => {
            let (mqtt_client, event_loop) = RelayMqttClient::new(config.mqtt.clone())
                .context("Failed to create MQTT client")?;

            background.push(mqtt_client.start(
                event_loop,
                UplinkSubscription {
                    topic: config.topics.uplink.clone(),
                    payload_base64: config.relay.uplink_payload_base64,
                },
                uplink_tx.clone(),
                shutdown.clone(),
            ));

            Arc::new(mqtt_client)
        }
        BrokerBackend::Memory => {
            warn!("Using in-memory broker, uplinks are only accepted via HTTP push");
            Arc::new(InMemoryBroker::new())
        }
    };

    // 处理器
    let uplink = Arc::new(UplinkRelay::new(store.clone()));
    let downlink = Arc::new(DownlinkRelay::new(
        publisher.clone(),
        config.topics.downlink.clone(),
    ));
    let fan_out = Arc::new(PlanChangeFanOut::new(
        store.clone(),
        publisher.clone(),
        config.topics.downlink.clone(),
    ));

    // 触发器
    background.push(triggers::spawn_uplink_trigger(
        uplink_rx,
        uplink.clone(),
        shutdown.clone(),
    ));
    background.push(triggers::spawn_change_trigger(
        store.subscribe(),
        downlink,
        fan_out,
        shutdown.clone(),
    ));

    // HTTP 服务
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = api_handlers::create_app(AppState::new(store, publisher, uplink, config));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;

    info!("========================================");
    info!("LoRa Relay listening on {}", addr);
    info!("  - Health check:    http://{}/health", addr);
    info!("  - Pub/Sub push:    http://{}/pubsub/uplink", addr);
    info!("  - Device messages: http://{}/devices/{{mac}}/messages", addr);
    info!("  - User plan:       http://{}/users/{{uid}}/plan", addr);
    info!("========================================");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("HTTP server error")?;

    // 停止后台任务
    shutdown.cancel();
    drop(uplink_tx);
    for handle in background {
        if let Err(e) = handle.await {
            error!("Background task failed: {}", e);
        }
    }

    info!("LoRa Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }

    info!("Received shutdown signal, stopping LoRa Relay...");
}
