// HTTP API：健康检查、Pub/Sub push 入口、应用和计费系统写入

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use lora_shared::{ApiResponse, Message, NewMessage, PushRequest, StoreError, SubscriptionPlan, User};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;

type ApiError = (StatusCode, Json<ApiResponse<()>>);

// Request types
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePlanRequest {
    #[serde(rename = "subscriptionPlan", default)]
    pub subscription_plan: Option<SubscriptionPlan>,
}

pub fn create_app(state: AppState) -> Router {
    let middleware_layer = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .into_inner();

    Router::new()
        .route("/health", get(health_check))
        .route("/pubsub/uplink", post(pubsub_uplink))
        .route(
            "/devices/{mac}/messages",
            post(send_device_message).get(list_device_messages),
        )
        .route("/users/{uid}/plan", put(update_user_plan))
        .layer(middleware_layer)
        .with_state(state)
}

fn store_error(context: &str, e: StoreError) -> ApiError {
    error!("API: {}: {}", context, e);

    let status = match e {
        StoreError::InvalidDocument(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::error(format!("{}: {}", context, e))))
}

/// GET /health
///
/// broker 断开（包括重连次数耗尽后）返回 503，便于外部监控重启进程。
pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<serde_json::Value>>) {
    let broker_connected = state.publisher.is_connected().await;
    let status = if broker_connected { "healthy" } else { "degraded" };

    let health_data = json!({
        "status": status,
        "service": "lora-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.uptime_seconds(),
        "store": state.store.backend_name(),
        "broker": {
            "backend": state.publisher.backend_name(),
            "connected": broker_connected,
        },
        "topics": {
            "uplink": state.config.topics.uplink,
            "downlink": state.config.topics.downlink,
        },
    });

    if broker_connected {
        return (StatusCode::OK, Json(ApiResponse::success(health_data)));
    }

    warn!("API: Health check degraded, broker is not connected");
    let mut response = ApiResponse::error("Broker is not connected".to_string());
    response.data = Some(health_data);
    (StatusCode::SERVICE_UNAVAILABLE, Json(response))
}

/// POST /pubsub/uplink - Pub/Sub push 投递
///
/// 上行中继自行处理所有错误，因此总是确认 (204)。
pub async fn pubsub_uplink(
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> StatusCode {
    debug!(
        "API: Push delivery {:?} from {:?}",
        request.message.message_id, request.subscription
    );

    state.uplink.handle(&request.message).await;
    StatusCode::NO_CONTENT
}

/// POST /devices/{mac}/messages - 应用发送下行消息
pub async fn send_device_message(
    Path(mac): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Message>>), ApiError> {
    if payload.text.trim().is_empty() {
        let response = ApiResponse::error("Message text cannot be empty".to_string());
        return Err((StatusCode::BAD_REQUEST, Json(response)));
    }

    info!("API: Queueing downlink message for device: {}", mac);

    match state.store.append_message(&mac, NewMessage::downlink(payload.text)).await {
        Ok(message) => Ok((StatusCode::CREATED, Json(ApiResponse::success(message)))),
        Err(e) => Err(store_error("Failed to store message", e)),
    }
}

/// GET /devices/{mac}/messages - 设备会话
pub async fn list_device_messages(
    Path(mac): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Message>>>, ApiError> {
    match state.store.list_messages(&mac).await {
        Ok(messages) => Ok(Json(ApiResponse::success(messages))),
        Err(e) => Err(store_error("Failed to list messages", e)),
    }
}

/// PUT /users/{uid}/plan - 计费系统更新订阅计划
pub async fn update_user_plan(
    Path(uid): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<UpdatePlanRequest>,
) -> Result<Json<ApiResponse<User>>, ApiError> {
    info!(
        "API: Updating plan for user {} to {:?}",
        uid, payload.subscription_plan
    );

    let user = User::new(uid, payload.subscription_plan);

    match state.store.put_user(user.clone()).await {
        Ok(()) => Ok(Json(ApiResponse::success(user))),
        Err(e) => Err(store_error("Failed to update user", e)),
    }
}
