use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

// 消息 ID 生成
pub fn generate_message_id() -> String {
    Uuid::new_v4().to_string()
}

// 时间工具函数
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// 分配严格递增的时间戳
///
/// 时钟未前进时在上一条的基础上加 1 微秒。
pub fn next_timestamp(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(previous) if now <= previous => previous + Duration::microseconds(1),
        _ => now,
    }
}

// 日志中截断过长的负载
pub fn truncate_for_log(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_generation() {
        let id1 = generate_message_id();
        let id2 = generate_message_id();

        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36);
    }

    #[test]
    fn test_next_timestamp_is_strictly_increasing() {
        let now = now_utc();

        assert_eq!(next_timestamp(None, now), now);
        assert_eq!(next_timestamp(Some(now - Duration::seconds(1)), now), now);

        // 时钟回拨或未前进
        let bumped = next_timestamp(Some(now), now);
        assert_eq!(bumped, now + Duration::microseconds(1));
        assert!(next_timestamp(Some(now + Duration::seconds(5)), now) > now + Duration::seconds(5));
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(truncate_for_log("temperature=21.5;humidity=40", 12), "temperatu...");
        // 多字节字符不会被截断在中间
        assert_eq!(truncate_for_log("温度二十一度半", 5), "温度...");
    }
}
