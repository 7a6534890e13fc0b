//! 频道运行时状态（仅内存）
//!
//! ChannelStateManager 是每个频道运行时状态的唯一修改入口：所有写操作经过同一把写锁，
//! 需要时间点视图的读操作在释放锁之前拷贝出快照，调用方不会在持锁期间做 I/O。

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

/// 单个频道的运行时状态，重启后由配置 + 新计数器重建
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelRuntimeState {
    pub name: String,
    /// 仅在传输层确认 join 成功后为 true
    pub connected: bool,
    /// 自上次成功发送以来的聊天行数
    pub chat_line_count: u32,
    /// 上次成功发送（或状态创建）的时间
    pub last_message_time: DateTime<Utc>,
}

impl ChannelRuntimeState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: false,
            chat_line_count: 0,
            last_message_time: Utc::now(),
        }
    }
}

/// 频道状态管理器
#[derive(Debug, Default)]
pub struct ChannelStateManager {
    channels: RwLock<HashMap<String, ChannelRuntimeState>>,
}

impl ChannelStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取频道状态的拷贝，不存在时惰性创建
    pub async fn get_or_create(&self, name: &str) -> ChannelRuntimeState {
        let mut channels = self.channels.write().await;
        channels
            .entry(name.to_string())
            .or_insert_with(|| ChannelRuntimeState::new(name))
            .clone()
    }

    /// 只读查询，不创建
    pub async fn get(&self, name: &str) -> Option<ChannelRuntimeState> {
        self.channels.read().await.get(name).cloned()
    }

    /// 按字段名批量更新；未知字段只记日志并忽略，便于与新版本的管理端兼容
    pub async fn update(&self, name: &str, fields: &Map<String, Value>) -> ChannelRuntimeState {
        let mut channels = self.channels.write().await;
        let state = channels
            .entry(name.to_string())
            .or_insert_with(|| ChannelRuntimeState::new(name));

        for (key, value) in fields {
            match (key.as_str(), value) {
                ("connected", Value::Bool(flag)) => state.connected = *flag,
                ("chat_line_count", Value::Number(n)) => match n.as_u64() {
                    Some(count) => state.chat_line_count = u32::try_from(count).unwrap_or(u32::MAX),
                    None => tracing::warn!(channel = name, "Ignoring non-integer chat_line_count {}", n),
                },
                ("last_message_time", Value::String(raw)) => {
                    match DateTime::parse_from_rfc3339(raw) {
                        Ok(ts) => state.last_message_time = ts.with_timezone(&Utc),
                        Err(e) => tracing::warn!(channel = name, "Ignoring bad last_message_time {}: {}", raw, e),
                    }
                }
                ("connected" | "chat_line_count" | "last_message_time", other) => {
                    tracing::warn!(channel = name, field = key.as_str(), "Ignoring value of wrong type: {}", other);
                }
                _ => {
                    tracing::warn!(channel = name, field = key.as_str(), "Ignoring unknown channel state field");
                }
            }
        }
        state.clone()
    }

    pub async fn set_connected(&self, name: &str, connected: bool) {
        let mut channels = self.channels.write().await;
        channels
            .entry(name.to_string())
            .or_insert_with(|| ChannelRuntimeState::new(name))
            .connected = connected;
    }

    /// 所有频道标记为未连接（传输层重连后 join 全部丢失）
    pub async fn mark_all_disconnected(&self) {
        let mut channels = self.channels.write().await;
        for state in channels.values_mut() {
            state.connected = false;
        }
    }

    /// 行数 +1 并返回新值；同一频道的并发消息在写锁下串行
    pub async fn increment_line_count(&self, name: &str) -> u32 {
        let mut channels = self.channels.write().await;
        let state = channels
            .entry(name.to_string())
            .or_insert_with(|| ChannelRuntimeState::new(name));
        state.chat_line_count = state.chat_line_count.saturating_add(1);
        state.chat_line_count
    }

    pub async fn reset_line_count(&self, name: &str) {
        if let Some(state) = self.channels.write().await.get_mut(name) {
            state.chat_line_count = 0;
        }
    }

    pub async fn update_last_message_time(&self, name: &str, at: DateTime<Utc>) {
        let mut channels = self.channels.write().await;
        channels
            .entry(name.to_string())
            .or_insert_with(|| ChannelRuntimeState::new(name))
            .last_message_time = at;
    }

    /// 成功发送后的复位：行数清零、时间更新，一次加锁完成
    pub async fn record_dispatch(&self, name: &str, at: DateTime<Utc>) {
        let mut channels = self.channels.write().await;
        let state = channels
            .entry(name.to_string())
            .or_insert_with(|| ChannelRuntimeState::new(name));
        state.chat_line_count = 0;
        state.last_message_time = at;
    }

    /// 丢弃频道的计数器（刷新配置时使用），连接状态保留
    pub async fn reset_counters(&self, name: &str) {
        if let Some(state) = self.channels.write().await.get_mut(name) {
            state.chat_line_count = 0;
            state.last_message_time = Utc::now();
        }
    }

    /// 已连接频道集合的拷贝，可在不持锁的情况下遍历
    pub async fn snapshot_connected(&self) -> BTreeSet<String> {
        self.channels
            .read()
            .await
            .values()
            .filter(|s| s.connected)
            .map(|s| s.name.clone())
            .collect()
    }

    /// 全部频道状态的拷贝
    pub async fn snapshot(&self) -> Vec<ChannelRuntimeState> {
        let mut all: Vec<_> = self.channels.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_get_or_create_is_lazy_and_stable() {
        let manager = ChannelStateManager::new();
        assert!(manager.get("foo").await.is_none());

        let created = manager.get_or_create("foo").await;
        assert_eq!(created.name, "foo");
        assert!(!created.connected);
        assert_eq!(created.chat_line_count, 0);

        manager.increment_line_count("foo").await;
        assert_eq!(manager.get_or_create("foo").await.chat_line_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        let manager = Arc::new(ChannelStateManager::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { manager.increment_line_count("foo").await }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=50).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_update_ignores_unknown_fields() {
        let manager = ChannelStateManager::new();
        let fields = json!({
            "connected": true,
            "chat_line_count": 7,
            "favourite_colour": "teal"
        });
        let state = manager.update("foo", fields.as_object().unwrap()).await;
        assert!(state.connected);
        assert_eq!(state.chat_line_count, 7);
    }

    #[tokio::test]
    async fn test_snapshot_connected_is_a_copy() {
        let manager = ChannelStateManager::new();
        manager.set_connected("a", true).await;
        manager.set_connected("b", false).await;
        manager.set_connected("c", true).await;

        let snapshot = manager.snapshot_connected().await;
        manager.set_connected("a", false).await;

        assert_eq!(snapshot.into_iter().collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(manager.snapshot_connected().await.len(), 1);
    }

    #[tokio::test]
    async fn test_record_dispatch_resets_counter() {
        let manager = ChannelStateManager::new();
        for _ in 0..4 {
            manager.increment_line_count("foo").await;
        }
        let now = Utc::now();
        manager.record_dispatch("foo", now).await;
        let state = manager.get("foo").await.unwrap();
        assert_eq!(state.chat_line_count, 0);
        assert_eq!(state.last_message_time, now);
    }
}
