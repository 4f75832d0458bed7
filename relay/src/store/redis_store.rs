// Redis 文档存储
// 设备、消息和用户文档持久化到 Redis，变更事件写入 Redis Stream，
// 通过消费者组分发：每个事件只交给组内一个实例，未确认的事件在重连后重放
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lora_shared::utils::generate_message_id;
use lora_shared::{Device, Direction, DocumentChange, Message, NewMessage, StoreConfig, StoreError, User};
use redis::aio::{Connection, MultiplexedConnection};
use redis::streams::{StreamId, StreamReadReply};
use redis::{Client as RedisClient, RedisResult, Script};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DocumentStore;

// 变更流的近似最大长度
const CHANGE_STREAM_MAX_LEN: usize = 100_000;
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);
const READ_BLOCK_MS: usize = 2_000;
const READ_BATCH: usize = 100;

// 分配时间戳、追加消息、写入变更事件在同一个脚本中完成，
// 保证同一设备的消息时间戳严格递增且与列表顺序一致
//
// KEYS: 设备 hash, 消息列表, 变更流
// ARGV: 设备 id, 消息 JSON (不含时间戳), 变更流长度上限
const APPEND_MESSAGE_SCRIPT: &str = r#"
local now = redis.call('TIME')
local secs = tonumber(now[1])
local micros = tonumber(now[2])
local last_secs = tonumber(redis.call('HGET', KEYS[1], 'last_secs') or '-1')
local last_micros = tonumber(redis.call('HGET', KEYS[1], 'last_micros') or '0')

if secs < last_secs or (secs == last_secs and micros <= last_micros) then
    secs = last_secs
    micros = last_micros + 1
    if micros >= 1000000 then
        secs = secs + 1
        micros = 0
    end
end

redis.call('HSETNX', KEYS[1], 'id', ARGV[1])
redis.call('HSET', KEYS[1], 'last_secs', secs, 'last_micros', micros)

local message = cjson.decode(ARGV[2])
message['ts_secs'] = secs
message['ts_micros'] = micros
local encoded = cjson.encode(message)

redis.call('RPUSH', KEYS[2], encoded)
redis.call('XADD', KEYS[3], 'MAXLEN', '~', ARGV[3], '*',
    'type', 'MessageCreated', 'device_id', ARGV[1], 'message', encoded)
return encoded
"#;

// 替换用户文档；只有旧文档存在时才写入 UserUpdated 事件
//
// KEYS: 用户 key, 变更流
// ARGV: 用户 id, 用户 JSON, 变更流长度上限
const PUT_USER_SCRIPT: &str = r#"
local previous = redis.call('SET', KEYS[1], ARGV[2], 'GET')
if not previous then
    return 0
end

redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[3], '*',
    'type', 'UserUpdated', 'user_id', ARGV[1], 'before', previous, 'after', ARGV[2])
return 1
"#;

// 键名
pub fn device_key(device_id: &str) -> String {
    format!("lora:devices:{}", device_id)
}

pub fn messages_key(device_id: &str) -> String {
    format!("lora:devices:{}:messages", device_id)
}

pub fn user_key(user_id: &str) -> String {
    format!("lora:users:{}", user_id)
}

pub fn owner_index_key(user_id: &str) -> String {
    format!("lora:users:{}:devices", user_id)
}

fn backend_error(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

// 脚本的输入，时间戳由脚本补上
#[derive(Serialize)]
struct DraftMessage<'a> {
    id: &'a str,
    text: &'a str,
    direction: Direction,
}

// 消息列表中的存储格式
#[derive(Debug, Deserialize)]
struct StoredMessage {
    id: String,
    text: String,
    direction: Direction,
    ts_secs: i64,
    ts_micros: u32,
}

impl StoredMessage {
    fn into_message(self) -> Result<Message, StoreError> {
        let timestamp = self
            .ts_micros
            .checked_mul(1_000)
            .and_then(|nanos| DateTime::<Utc>::from_timestamp(self.ts_secs, nanos))
            .ok_or_else(|| {
                StoreError::InvalidDocument(format!("Invalid timestamp on message {}", self.id))
            })?;

        Ok(Message {
            id: self.id,
            text: self.text,
            timestamp,
            direction: self.direction,
        })
    }
}

fn decode_message(json: &str) -> Result<Message, StoreError> {
    serde_json::from_str::<StoredMessage>(json)?.into_message()
}

// 变更流位置
#[derive(Debug, Clone)]
struct ChangeStream {
    key: String,
    group: String,
    consumer: String,
}

/// Redis 文档存储
///
/// 本进程的写入同样经由变更流回到本地变更订阅，
/// 其他写入方只要向同一个流写入同格式事件即可触发中继。
pub struct RedisDocumentStore {
    conn: MultiplexedConnection,
    changes: broadcast::Sender<DocumentChange>,
    change_stream: String,
    append_script: Script,
    put_user_script: Script,
}

impl RedisDocumentStore {
    /// 连接 Redis，创建消费者组并启动变更监听任务
    pub async fn connect(config: &StoreConfig, shutdown: CancellationToken) -> Result<Self, StoreError> {
        info!("Connecting to Redis document store: {}", config.redis_url);

        let client = RedisClient::open(config.redis_url.as_str()).map_err(backend_error)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend_error)?;

        // 测试连接
        let _: String = redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(backend_error)?;

        let stream = ChangeStream {
            key: config.change_stream.clone(),
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
        };

        // 在任何写入之前创建消费者组
        ensure_consumer_group(&mut conn, &stream)
            .await
            .map_err(backend_error)?;

        let (changes, _) = broadcast::channel(config.change_feed_capacity.max(1));
        tokio::spawn(run_change_listener(client, stream.clone(), changes.clone(), shutdown));

        info!(
            "Redis document store ready (stream {}, group {}, consumer {})",
            stream.key, stream.group, stream.consumer
        );

        Ok(Self {
            conn,
            changes,
            change_stream: stream.key,
            append_script: Script::new(APPEND_MESSAGE_SCRIPT),
            put_user_script: Script::new(PUT_USER_SCRIPT),
        })
    }
}

#[async_trait]
impl DocumentStore for RedisDocumentStore {
    async fn append_message(&self, device_id: &str, message: NewMessage) -> Result<Message, StoreError> {
        if device_id.is_empty() {
            return Err(StoreError::InvalidDocument("device id cannot be empty".to_string()));
        }

        let id = generate_message_id();
        let draft = serde_json::to_string(&DraftMessage {
            id: &id,
            text: &message.text,
            direction: message.direction,
        })?;

        let mut conn = self.conn.clone();
        let stored: String = self
            .append_script
            .key(device_key(device_id))
            .key(messages_key(device_id))
            .key(&self.change_stream)
            .arg(device_id)
            .arg(draft)
            .arg(CHANGE_STREAM_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;

        decode_message(&stored)
    }

    async fn upsert_device(&self, device: Device) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = device_key(&device.id);

        let previous_owner: Option<String> = redis::cmd("HGET")
            .arg(&key)
            .arg("owner_uid")
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET").arg(&key).arg("id").arg(&device.id).ignore();

        match &device.owner_uid {
            Some(owner) => {
                pipe.cmd("HSET").arg(&key).arg("owner_uid").arg(owner).ignore()
                    .cmd("SADD").arg(owner_index_key(owner)).arg(&device.id).ignore();
            }
            None => {
                pipe.cmd("HDEL").arg(&key).arg("owner_uid").ignore();
            }
        }

        // 所有者变更时维护索引
        if let Some(previous) = previous_owner.filter(|p| Some(p) != device.owner_uid.as_ref()) {
            pipe.cmd("SREM").arg(owner_index_key(&previous)).arg(&device.id).ignore();
        }

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(backend_error)?;

        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        let mut conn = self.conn.clone();

        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(device_key(device_id))
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;

        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(Device {
            id: device_id.to_string(),
            owner_uid: fields.get("owner_uid").cloned(),
        }))
    }

    async fn list_messages(&self, device_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut conn = self.conn.clone();

        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(messages_key(device_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;

        raw.iter().map(|json| decode_message(json)).collect()
    }

    async fn devices_owned_by(&self, user_id: &str) -> Result<Vec<Device>, StoreError> {
        let mut conn = self.conn.clone();

        let mut ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(owner_index_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        ids.sort();

        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            // 索引可能落后于设备文档，以文档为准
            match self.get_device(&id).await? {
                Some(device) if device.owner_uid.as_deref() == Some(user_id) => devices.push(device),
                _ => warn!("Stale owner index entry {} for user {}", id, user_id),
            }
        }

        Ok(devices)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let mut conn = self.conn.clone();

        let raw: Option<String> = redis::cmd("GET")
            .arg(user_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;

        raw.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn put_user(&self, user: User) -> Result<(), StoreError> {
        if user.id.is_empty() {
            return Err(StoreError::InvalidDocument("user id cannot be empty".to_string()));
        }

        let json = serde_json::to_string(&user)?;
        let mut conn = self.conn.clone();

        // SET ... GET 需要 Redis >= 6.2
        let updated: i64 = self
            .put_user_script
            .key(user_key(&user.id))
            .key(&self.change_stream)
            .arg(&user.id)
            .arg(json)
            .arg(CHANGE_STREAM_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;

        debug!("Stored user {} (replaced existing: {})", user.id, updated == 1);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.changes.subscribe()
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

// 组已存在时忽略 BUSYGROUP
async fn ensure_consumer_group<C>(conn: &mut C, stream: &ChangeStream) -> RedisResult<()>
where
    C: redis::aio::ConnectionLike + Send,
{
    let created = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(&stream.key)
        .arg(&stream.group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async::<_, ()>(conn)
        .await;

    match created {
        Ok(()) => {
            info!("Created consumer group {} on {}", stream.group, stream.key);
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(e),
    }
}

// 变更监听任务，连接断开后重新连接并重放未确认的事件
async fn run_change_listener(
    client: RedisClient,
    stream: ChangeStream,
    changes: broadcast::Sender<DocumentChange>,
    shutdown: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = consume_changes(&client, &stream, &changes) => result,
        };

        if let Err(e) = result {
            error!("Redis change listener failed: {}", e);
        }

        warn!("Redis change stream interrupted, reconnecting");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(LISTENER_RETRY_DELAY) => {}
        }
    }

    info!("Redis change listener stopped");
}

// 只在出错时返回
async fn consume_changes(
    client: &RedisClient,
    stream: &ChangeStream,
    changes: &broadcast::Sender<DocumentChange>,
) -> RedisResult<()> {
    // 阻塞读取使用独立连接
    let mut conn = client.get_async_connection().await?;
    ensure_consumer_group(&mut conn, stream).await?;

    // 先处理已投递给本消费者但尚未确认的事件
    loop {
        let entries = read_group(&mut conn, stream, "0", None).await?;
        if entries.is_empty() {
            break;
        }

        info!("Replaying {} unacknowledged change events", entries.len());
        forward_entries(&mut conn, stream, entries, changes).await?;
    }

    loop {
        let entries = read_group(&mut conn, stream, ">", Some(READ_BLOCK_MS)).await?;
        if !entries.is_empty() {
            forward_entries(&mut conn, stream, entries, changes).await?;
        }
    }
}

async fn read_group(
    conn: &mut Connection,
    stream: &ChangeStream,
    start: &str,
    block_ms: Option<usize>,
) -> RedisResult<Vec<StreamId>> {
    let mut cmd = redis::cmd("XREADGROUP");
    cmd.arg("GROUP")
        .arg(&stream.group)
        .arg(&stream.consumer)
        .arg("COUNT")
        .arg(READ_BATCH);

    if let Some(block_ms) = block_ms {
        cmd.arg("BLOCK").arg(block_ms);
    }

    cmd.arg("STREAMS").arg(&stream.key).arg(start);

    // 阻塞超时返回 nil
    let reply: Option<StreamReadReply> = cmd.query_async(conn).await?;

    Ok(reply
        .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
        .unwrap_or_default())
}

// 交给本地变更订阅后确认；无法解析的事件记录后同样确认
async fn forward_entries(
    conn: &mut Connection,
    stream: &ChangeStream,
    entries: Vec<StreamId>,
    changes: &broadcast::Sender<DocumentChange>,
) -> RedisResult<()> {
    let mut ids = Vec::with_capacity(entries.len());

    for entry in entries {
        match decode_change(&entry) {
            Ok(change) => {
                if changes.send(change).is_err() {
                    debug!("No change feed subscribers, event {} dropped", entry.id);
                }
            }
            Err(e) => error!("Dropping undecodable change event {}: {}", entry.id, e),
        }
        ids.push(entry.id);
    }

    let acked: i64 = redis::cmd("XACK")
        .arg(&stream.key)
        .arg(&stream.group)
        .arg(&ids)
        .query_async(conn)
        .await?;

    debug!("Acknowledged {} change events", acked);
    Ok(())
}

fn decode_change(entry: &StreamId) -> Result<DocumentChange, StoreError> {
    let field = |name: &str| {
        entry.get::<String>(name).ok_or_else(|| {
            StoreError::InvalidDocument(format!("Change event {} is missing {}", entry.id, name))
        })
    };

    match field("type")?.as_str() {
        "MessageCreated" => Ok(DocumentChange::MessageCreated {
            device_id: field("device_id")?,
            message: decode_message(&field("message")?)?,
        }),
        "UserUpdated" => Ok(DocumentChange::UserUpdated {
            user_id: field("user_id")?,
            before: serde_json::from_str(&field("before")?)?,
            after: serde_json::from_str(&field("after")?)?,
        }),
        other => Err(StoreError::InvalidDocument(format!(
            "Unknown change event type {} in {}",
            other, entry.id
        ))),
    }
}
